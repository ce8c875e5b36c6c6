//! Startup known-answer tests
//!
//! The tests run once per process. A failure is remembered and reported on
//! every later call, so a broken primitive can never be used.

use std::sync::OnceLock;

use aes::Aes256;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher, generic_array::GenericArray};
use chacha20::{ChaCha20, ChaCha20Legacy};
use sha2::{Digest, Sha256, Sha512};
use tracing::{debug, error};

use crate::error::{DbError, Result};

use super::cipher::{CipherId, CipherSuite};
use super::kdf::{pbkdf2_256bit, pbkdf2_256bit_cancellable};
use super::mac::{hmac_sha1, hmac_sha256};

static SELF_TEST: OnceLock<std::result::Result<(), &'static str>> = OnceLock::new();

/// Run the known-answer tests once and return the cached outcome
pub fn ensure_self_tests() -> Result<()> {
    let outcome = SELF_TEST.get_or_init(|| {
        let outcome = run_self_tests();
        match outcome {
            Ok(()) => debug!("crypto self-tests passed"),
            Err(name) => error!(test = name, "crypto self-test failed"),
        }
        outcome
    });
    (*outcome).map_err(DbError::SelfTestFailed)
}

fn check(name: &'static str, actual: &[u8], expected_hex: &str) -> std::result::Result<(), &'static str> {
    if hex::encode(actual) == expected_hex {
        Ok(())
    } else {
        Err(name)
    }
}

/// Run every known-answer test, returning the name of the first failure
pub fn run_self_tests() -> std::result::Result<(), &'static str> {
    // FIPS-197 C.3
    let key: Vec<u8> = (0u8..32).collect();
    let aes = Aes256::new(GenericArray::from_slice(&key));
    let mut block = GenericArray::clone_from_slice(&[
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd,
        0xee, 0xff,
    ]);
    aes.encrypt_block(&mut block);
    check("AES-256", &block, "8ea2b7ca516745bfeafc49904b496089")?;

    // all-zero key and nonce, first keystream block
    const CHACHA_ZERO: &str = "76b8e0ada0f13d90405d6ae55386bd28bdd219b8a08ded1aa836efcc8b770dc7";
    let zero_key = [0u8; 32];
    let mut stream = [0u8; 32];
    ChaCha20::new((&zero_key).into(), (&[0u8; 12]).into()).apply_keystream(&mut stream);
    check("ChaCha20", &stream, CHACHA_ZERO)?;

    let mut stream = [0u8; 32];
    ChaCha20Legacy::new((&zero_key).into(), (&[0u8; 8]).into()).apply_keystream(&mut stream);
    check("ChaCha20 (64-bit nonce)", &stream, CHACHA_ZERO)?;

    check(
        "SHA-256",
        &Sha256::digest(b"abc"),
        "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
    )?;
    check(
        "SHA-512",
        &Sha512::digest(b"abc"),
        "ddaf35a193617abacc417349ae20413112e6fa4e89a97ea20a9eeee64b55d39a\
         2192992a274fc1a836ba3c23a3feebbd454d4423643ce80e2a9ac94fa54ca49f",
    )?;

    // RFC 4231 / RFC 2202 test case 2
    check(
        "HMAC-SHA-256",
        &hmac_sha256(b"Jefe", &[b"what do ya want for nothing?"]),
        "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843",
    )?;
    check(
        "HMAC-SHA-1",
        &hmac_sha1(b"Jefe", b"what do ya want for nothing?"),
        "effcdf6ae5eb2fa2d27416d5f184df9c259a7c79",
    )?;

    const PBKDF2_TWO: &str = "ae4d0c95af6b46d32d0adff928f06dd02a303f8ef3c251dfd6e2d85a95474c43";
    check("PBKDF2-HMAC-SHA-256", &*pbkdf2_256bit(b"password", b"salt", 2), PBKDF2_TWO)?;
    let never = std::sync::atomic::AtomicBool::new(false);
    let polled = pbkdf2_256bit_cancellable(b"password", b"salt", 2, &never)
        .map_err(|_| "PBKDF2 (cancellable)")?;
    check("PBKDF2 (cancellable)", &*polled, PBKDF2_TWO)?;

    for id in [CipherId::Aes256Cbc, CipherId::ChaCha20] {
        suite_roundtrip(id)?;
    }

    Ok(())
}

fn suite_roundtrip(id: CipherId) -> std::result::Result<(), &'static str> {
    let name = match id {
        CipherId::Aes256Cbc => "AES-256-CBC round trip",
        CipherId::ChaCha20 => "ChaCha20 round trip",
    };
    let key = [0x5au8; 32];
    let iv = vec![0xa5u8; id.iv_size()];
    let plain = [0x3cu8; 48];
    let mut buf = plain;

    let mut enc = CipherSuite::new(id, &key);
    enc.set_iv(&iv).map_err(|_| name)?;
    enc.encrypt(&mut buf).map_err(|_| name)?;
    if buf == plain {
        return Err(name);
    }

    let mut dec = CipherSuite::new(id, &key);
    dec.set_iv(&iv).map_err(|_| name)?;
    dec.decrypt(&mut buf).map_err(|_| name)?;
    if buf != plain {
        return Err(name);
    }
    Ok(())
}

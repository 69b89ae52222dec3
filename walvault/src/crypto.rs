//! Encryption capability.
//!
//! Cipher suites are external collaborators: the engine wraps every upload
//! stream with [`Crypter::encrypt`] and every download stream with
//! [`Crypter::decrypt`] and otherwise knows nothing about keys or formats.
//! The core ships only the pass-through implementation.

use std::pin::Pin;

use tokio::io::AsyncRead;

pub type ByteStream<'a> = Pin<Box<dyn AsyncRead + Send + 'a>>;

pub trait Crypter: Send + Sync + 'static {
    fn encrypt<'a>(&self, reader: ByteStream<'a>) -> ByteStream<'a>;
    fn decrypt<'a>(&self, reader: ByteStream<'a>) -> ByteStream<'a>;
}

/// No encryption configured.
pub struct NoCrypter;

impl Crypter for NoCrypter {
    fn encrypt<'a>(&self, reader: ByteStream<'a>) -> ByteStream<'a> {
        reader
    }

    fn decrypt<'a>(&self, reader: ByteStream<'a>) -> ByteStream<'a> {
        reader
    }
}

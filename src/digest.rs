// Copyright 2023-2024 the Tectonic Project
// Licensed under the MIT License

//! Content fingerprints.
//!
//! Change detection throughout the engine rests on cryptographic digests of
//! byte sequences: file contents, encoded operation arguments, and encoded
//! return values all reduce to a [`DigestData`]. Equality is the only
//! operation ever performed on a digest.

use digest::OutputSizeUser;
use generic_array::GenericArray;
use sha2::{Digest, Sha256};
use std::{fs, io, path::Path};
use tectonic_errors::prelude::*;

/// A type used to compute data digests for change detection.
///
/// This is currently [`sha2::Sha256`].
pub type DigestComputer = Sha256;

/// The data type emitted by [`DigestComputer`].
///
/// This is a particular form of [`generic_array::GenericArray`] with a [`u8`]
/// data type and a size appropriate to the digest. For the current SHA256
/// implementation, that's 32 bytes.
pub type DigestData = GenericArray<u8, <DigestComputer as OutputSizeUser>::OutputSize>;

/// Compute the digest of an in-memory byte sequence.
pub fn digest_of_bytes(data: impl AsRef<[u8]>) -> DigestData {
    let mut dc = DigestComputer::new();
    dc.update(data.as_ref());
    dc.finalize()
}

/// Compute the digest of a file's contents, streaming it from disk.
///
/// Returns the file size alongside the digest. We could get the size from the
/// filesystem metadata, but as long as we have to read the whole thing it
/// seems better to use the size that we get from the streaming operation.
pub(crate) fn digest_of_file(p: impl AsRef<Path>) -> Result<(u64, DigestData)> {
    let mut f = fs::File::open(p)?;
    let mut dc = DigestComputer::new();
    let size = io::copy(&mut f, &mut dc)?;
    let digest = dc.finalize();
    Ok((size, digest))
}

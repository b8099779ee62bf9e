pub mod xz;

use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::{Abort, Finish};
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::WithDebugObjectAndFnName;
use derive_more::From;
use io_enum::Write;
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use std::io;
use std::io::{Read, Write};
use std::result;
use std::sync::{Arc, OnceLock};
use validator::{Validate, ValidationErrors};

#[derive(Write, From)]
pub enum Compressor<W: Write> {
    None(W),
    XzEncoder(XzEncoder<W>),
}

impl<W: Write> Compressor<W> {
    pub fn get_mut(&mut self) -> &mut W {
        match self {
            Compressor::None(w) => w,
            Compressor::XzEncoder(w) => w.get_mut(),
        }
    }
}

#[derive(Clone, From, Serialize, Deserialize, Debug)]
#[serde(tag = "compressor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CompressorConfig {
    None,
    Xz(xz::XzConfig),
}

impl Default for CompressorConfig {
    fn default() -> Self {
        CompressorConfig::Xz(xz::XzConfig::default())
    }
}

impl Validate for CompressorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            CompressorConfig::None => Ok(()),
            CompressorConfig::Xz(xz) => xz.validate(),
        }
    }
}

pub trait CompressorBuilder<W: Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::XzEncoder(w) => w.finish(),
        }
    }
}

impl<W: Write> CompressorBuilder<W> for CompressorConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        match self {
            CompressorConfig::None => Ok(Compressor::None(writer)),
            CompressorConfig::Xz(xz) => xz.build_compressor(writer),
        }
        .with_debug_object_and_fn_name(self.clone(), "build_compressor")
    }
}

static XZ_FILE_EXT: OnceLock<Arc<str>> = OnceLock::new();
impl FileExtProvider for CompressorConfig {
    fn file_ext(&self) -> Option<Arc<str>> {
        match self {
            CompressorConfig::None => None,
            CompressorConfig::Xz(_) => Some(XZ_FILE_EXT.get_or_init(|| "xz".into()).clone()),
        }
    }
}

impl CompressorConfig {
    /// Compresses everything read from `source` into `sink` as it arrives.
    ///
    /// On failure the sink is aborted before the encoder is dropped, so no
    /// envelope trailer reaches the sink after an error.
    pub fn compress_stream<R: Read, W: Write + Abort>(&self, mut source: R, sink: W) -> Result<W> {
        let mut encoder = self.build_compressor(sink).map_err(Error::transform)?;

        match io::copy(&mut source, &mut encoder) {
            Ok(bytes) => {
                tracing::debug!("Compressed {} bytes", bytes);
                encoder.finish().map_err(Error::transform)
            }
            Err(e) => {
                let error = Error::transform(e);
                encoder.get_mut().abort(&error);
                Err(error)
            }
        }
    }
}

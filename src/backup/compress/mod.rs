pub mod xz;

use crate::backup::file_ext::FileExtProvider;
use crate::backup::finish::Finish;
use crate::backup::result_error::result::Result;
use derive_more::From;
use io_enum::{Read, Write};
use liblzma::read::XzDecoder;
use liblzma::write::XzEncoder;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::result;
use std::sync::{Arc, OnceLock};
use validator::{Validate, ValidationErrors};

#[derive(Write, From)]
pub enum Compressor<W: io::Write> {
    None(W),
    XzEncoder(XzEncoder<W>),
}

#[derive(Read, From)]
pub enum Decompressor<R: io::Read> {
    None(R),
    XzDecoder(XzDecoder<R>),
}

#[derive(Clone, From, Serialize, Deserialize, Debug, PartialEq, Eq)]
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

pub trait CompressorBuilder<W: io::Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

impl<W: io::Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::XzEncoder(w) => w.finish(),
        }
    }
}

impl<W: io::Write> CompressorBuilder<W> for CompressorConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        match self {
            CompressorConfig::None => Ok(Compressor::None(writer)),
            CompressorConfig::Xz(xz) => xz.build_compressor(writer),
        }
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

impl<R: io::Read> Decompressor<R> {
    /// Picks the decoder from the archive's file extension.
    pub fn for_path<P: AsRef<Path>>(path: P, reader: R) -> Self {
        match path.as_ref().extension().and_then(|e| e.to_str()) {
            Some("xz") => XzDecoder::new(reader).into(),
            _ => Decompressor::None(reader),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read, Write};

    #[test]
    fn test_default_is_xz() {
        let config = CompressorConfig::default();
        assert!(matches!(config, CompressorConfig::Xz(_)));
        assert_eq!(config.file_ext().unwrap().as_ref(), "xz");
        assert!(CompressorConfig::None.file_ext().is_none());
    }

    #[test]
    fn test_config_serialization() {
        let serialized = serde_json::to_string(&CompressorConfig::None).unwrap();
        assert_eq!(serialized, "{\"compressor_type\":\"none\"}");

        let config: CompressorConfig =
            serde_json::from_str("{\"compressor_type\":\"xz\",\"level\":1}").unwrap();
        assert_eq!(
            config,
            CompressorConfig::Xz(xz::XzConfig { level: Some(1), thread: None })
        );
    }

    #[test]
    fn test_none_passthrough() {
        let mut compressor = CompressorConfig::None
            .build_compressor(Cursor::new(Vec::new()))
            .unwrap();
        compressor.write_all(b"plain").unwrap();
        let bytes = compressor.finish().unwrap().into_inner();
        assert_eq!(bytes, b"plain");

        let mut out = Vec::new();
        Decompressor::for_path("a.tar", bytes.as_slice())
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"plain");
    }

    #[test]
    fn test_decompressor_selected_by_extension() {
        let config = CompressorConfig::Xz(xz::XzConfig { level: Some(0), thread: Some(1) });
        let mut compressor = config.build_compressor(Cursor::new(Vec::new())).unwrap();
        compressor.write_all(b"packed").unwrap();
        let bytes = compressor.finish().unwrap().into_inner();

        let mut decoder = Decompressor::for_path("/b/backup.tar.xz", bytes.as_slice());
        assert!(matches!(decoder, Decompressor::XzDecoder(_)));
        let mut out = Vec::new();
        decoder.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"packed");
    }
}

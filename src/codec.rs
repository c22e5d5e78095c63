use std::io::Cursor;

use polars::prelude::*;
use polars_io::ipc::{IpcCompression, IpcReader, IpcWriter};
use polars_io::{SerReader, SerWriter};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Format {
    Parquet,
    Ipc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    Snappy,
    Lz4Raw,
    Zstd,
}

/// Partition codec: one encode per partition write, one decode per read.
///
/// Which codec a cube uses is configuration, selected once at the entry
/// boundary and applied uniformly to every partition blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Codec {
    pub format: Format,
    pub compression: Option<Compression>,
}

impl Default for Codec {
    fn default() -> Self {
        Self {
            format: Format::Parquet,
            compression: Some(Compression::Snappy),
        }
    }
}

impl Codec {
    pub fn new(format: Format, compression: Option<Compression>) -> Self {
        Self {
            format,
            compression,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self.format {
            Format::Parquet => "parquet",
            Format::Ipc => "ipc",
        }
    }

    pub fn encode(&self, df: &mut DataFrame) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        match self.format {
            Format::Parquet => {
                ParquetWriter::new(&mut buf)
                    .with_compression(self.parquet_compression())
                    .finish(df)?;
            }
            Format::Ipc => {
                IpcWriter::new(&mut buf)
                    .with_compression(self.ipc_compression())
                    .finish(df)?;
            }
        }
        Ok(buf)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<DataFrame> {
        let df = match self.format {
            Format::Parquet => ParquetReader::new(Cursor::new(bytes)).finish()?,
            Format::Ipc => IpcReader::new(Cursor::new(bytes)).finish()?,
        };
        Ok(df)
    }

    fn parquet_compression(&self) -> ParquetCompression {
        match self.compression {
            None => ParquetCompression::Uncompressed,
            Some(Compression::Snappy) => ParquetCompression::Snappy,
            Some(Compression::Lz4Raw) => ParquetCompression::Lz4Raw,
            Some(Compression::Zstd) => ParquetCompression::Zstd(None),
        }
    }

    fn ipc_compression(&self) -> Option<IpcCompression> {
        match self.compression {
            None => None,
            // IPC has no snappy codec; LZ4 is the light-weight option.
            Some(Compression::Snappy) | Some(Compression::Lz4Raw) => Some(IpcCompression::LZ4),
            Some(Compression::Zstd) => Some(IpcCompression::ZSTD),
        }
    }
}

use carquet_types::Cid;
use iroh_car::CarHeader;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Runtime;

use crate::error::{CarError, CarResult};
use crate::reader::local_runtime;

/// Streaming CAR v1 writer.
///
/// The header is emitted ahead of the first section (or by
/// [`CarWriter::finish`] for an empty archive). The caller is responsible
/// for `cid` matching `data`.
pub struct CarWriter<W> {
    runtime: Runtime,
    inner: iroh_car::CarWriter<W>,
    blocks_written: u64,
}

impl<W: AsyncWrite + Send + Unpin> CarWriter<W> {
    /// Start an archive naming `roots`.
    pub fn new(writer: W, roots: &[Cid]) -> CarResult<Self> {
        let header = CarHeader::new_v1(roots.to_vec());
        Ok(Self {
            runtime: local_runtime()?,
            inner: iroh_car::CarWriter::new(header, writer),
            blocks_written: 0,
        })
    }

    /// Append one block section.
    pub fn write_block(&mut self, cid: &Cid, data: &[u8]) -> CarResult<()> {
        self.runtime
            .block_on(self.inner.write(*cid, data))
            .map_err(write_error)?;
        self.blocks_written += 1;
        Ok(())
    }

    /// Number of sections written so far.
    pub fn blocks_written(&self) -> u64 {
        self.blocks_written
    }

    /// Flush and return the underlying writer.
    pub fn finish(self) -> CarResult<W> {
        let Self { runtime, inner, .. } = self;
        runtime.block_on(async {
            let mut writer = inner.finish().await.map_err(write_error)?;
            writer.flush().await?;
            Ok(writer)
        })
    }
}

fn write_error(e: iroh_car::Error) -> CarError {
    match e {
        iroh_car::Error::Io(io) => CarError::Io(io),
        other => CarError::Write(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use carquet_codec::Ipld;
    use carquet_types::{cid_for, BLAKE3, RAW};

    #[test]
    fn header_is_canonical_dag_cbor() {
        let cid = cid_for(RAW, BLAKE3, b"root").unwrap();
        let bytes = CarWriter::new(Vec::new(), &[cid]).unwrap().finish().unwrap();
        // Header is short enough for a one-byte length prefix.
        let len = bytes[0] as usize;
        let header = &bytes[1..];
        assert_eq!(header.len(), len);
        let value = carquet_codec::decode(header).unwrap();
        assert_eq!(carquet_codec::encode(&value).unwrap(), header);
        let Ipld::Map(entries) = value else {
            panic!("header is not a map");
        };
        assert_eq!(entries.get("version"), Some(&Ipld::Integer(1)));
        assert_eq!(entries.get("roots"), Some(&Ipld::List(vec![Ipld::Link(cid)])));
    }

    #[test]
    fn counts_sections() {
        let cid = cid_for(RAW, BLAKE3, b"x").unwrap();
        let mut writer = CarWriter::new(Vec::new(), &[cid]).unwrap();
        writer.write_block(&cid, b"x").unwrap();
        writer.write_block(&cid, b"x").unwrap();
        assert_eq!(writer.blocks_written(), 2);
    }
}

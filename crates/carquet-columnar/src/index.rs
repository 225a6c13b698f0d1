use std::cmp::Ordering;
use std::fs::File;
use std::path::Path;

use carquet_types::Cid;
use memmap2::Mmap;

use crate::error::{ColumnarError, ColumnarResult};
use crate::frame::{check_trailer, put_u32, put_u64, Frame};

pub const INDEX_MAGIC: &[u8; 4] = b"CQIX";
pub const INDEX_VERSION: u32 = 2;
pub const INDEX_FILE_NAME: &str = "index.cqi";

/// Longest binary CID a record can hold.
pub const MAX_KEY_WIDTH: usize = u8::MAX as usize;

const FILE: &str = "index";
/// `magic ‖ version u32 ‖ count u64 ‖ key_width u32`.
const HEADER_LEN: usize = 20;
const FAN_OUT_LEN: usize = 256 * 4;
/// `bucket u32 ‖ segment u32 ‖ row u32`.
const LOCATION_LEN: usize = 12;

/// Location of one block's row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub cid: Cid,
    pub bucket: u32,
    pub segment: u32,
    pub row: u32,
}

fn record_len(key_width: usize) -> usize {
    1 + key_width + LOCATION_LEN
}

/// Serialize entries as an index file.
///
/// Records are `cid_len u8 ‖ cid padded to key_width ‖ location`, where
/// `key_width` is the longest binary CID present. Entries are sorted by
/// CID bytes. When a CID occurs more than once (an archive may repeat a
/// block), the lowest `(bucket, segment, row)` wins, so the output depends
/// only on the set of entries.
pub fn build_index(entries: Vec<IndexEntry>) -> ColumnarResult<Vec<u8>> {
    let mut keyed: Vec<(Vec<u8>, IndexEntry)> =
        entries.into_iter().map(|e| (e.cid.to_bytes(), e)).collect();
    keyed.sort_by(|(ka, a), (kb, b)| {
        ka.cmp(kb)
            .then(a.bucket.cmp(&b.bucket))
            .then(a.segment.cmp(&b.segment))
            .then(a.row.cmp(&b.row))
    });
    keyed.dedup_by(|(later, _), (earlier, _)| later == earlier);

    let key_width = keyed.iter().map(|(k, _)| k.len()).max().unwrap_or(1);
    if key_width > MAX_KEY_WIDTH {
        return Err(ColumnarError::corrupt(
            FILE,
            format!("cid of {key_width} bytes exceeds the {MAX_KEY_WIDTH} byte key limit"),
        ));
    }

    let mut fan_out = [0u32; 256];
    for (key, _) in &keyed {
        fan_out[key[0] as usize] += 1;
    }
    for i in 1..256 {
        fan_out[i] += fan_out[i - 1];
    }

    let mut buf =
        Vec::with_capacity(HEADER_LEN + FAN_OUT_LEN + keyed.len() * record_len(key_width) + 32);
    buf.extend_from_slice(INDEX_MAGIC);
    put_u32(&mut buf, INDEX_VERSION);
    put_u64(&mut buf, keyed.len() as u64);
    put_u32(&mut buf, key_width as u32);
    for count in fan_out {
        put_u32(&mut buf, count);
    }
    for (key, entry) in &keyed {
        buf.push(key.len() as u8);
        buf.extend_from_slice(key);
        buf.resize(buf.len() + key_width - key.len(), 0);
        put_u32(&mut buf, entry.bucket);
        put_u32(&mut buf, entry.segment);
        put_u32(&mut buf, entry.row);
    }
    let checksum = *blake3::hash(&buf).as_bytes();
    buf.extend_from_slice(&checksum);
    Ok(buf)
}

/// Sorted, fixed-width index over every indexed block.
///
/// Lookups narrow by the first CID byte through the fan-out table, then
/// binary search the records in place. Nothing is copied out of the backing
/// bytes until a record matches.
#[derive(Debug)]
pub struct Index<B = Mmap> {
    data: B,
    count: usize,
    key_width: usize,
    fan_out: [u32; 256],
}

impl Index<Mmap> {
    pub fn open(path: &Path) -> ColumnarResult<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        Self::parse(mmap)
    }
}

impl<B: AsRef<[u8]>> Index<B> {
    /// Validate header, fan-out and checksum.
    pub fn parse(data: B) -> ColumnarResult<Self> {
        let bytes = data.as_ref();
        check_trailer(bytes, FILE)?;
        let mut frame = Frame::new(bytes, FILE);
        frame.expect_header(INDEX_MAGIC, INDEX_VERSION)?;
        let count = usize::try_from(frame.u64()?)
            .map_err(|_| ColumnarError::corrupt(FILE, "record count overflows"))?;
        let key_width = frame.u32()? as usize;
        if key_width == 0 || key_width > MAX_KEY_WIDTH {
            return Err(ColumnarError::corrupt(FILE, format!("bad key width {key_width}")));
        }

        let mut fan_out = [0u32; 256];
        let mut previous = 0;
        for slot in &mut fan_out {
            *slot = frame.u32()?;
            if *slot < previous {
                return Err(ColumnarError::corrupt(FILE, "fan-out not monotonic"));
            }
            previous = *slot;
        }
        if fan_out[255] as usize != count {
            return Err(ColumnarError::corrupt(FILE, "fan-out total disagrees with count"));
        }
        let expected = count
            .checked_mul(record_len(key_width))
            .and_then(|n| n.checked_add(HEADER_LEN + FAN_OUT_LEN + 32));
        if expected != Some(bytes.len()) {
            return Err(ColumnarError::corrupt(FILE, "record region size mismatch"));
        }
        let index = Self {
            data,
            count,
            key_width,
            fan_out,
        };
        index.check_records()?;
        Ok(index)
    }

    /// Every record must decode, sit in its fan-out bucket, and sort
    /// strictly after its predecessor; lookups and iteration rely on it.
    fn check_records(&self) -> ColumnarResult<()> {
        let mut previous: Option<&[u8]> = None;
        for i in 0..self.count {
            self.entry(i)?;
            let cid = self.record_cid(i)?;
            let first = cid[0] as usize;
            let lo = if first == 0 { 0 } else { self.fan_out[first - 1] as usize };
            if i < lo || i >= self.fan_out[first] as usize {
                return Err(ColumnarError::corrupt(FILE, format!("record {i} outside fan-out range")));
            }
            if previous.is_some_and(|p| p >= cid) {
                return Err(ColumnarError::corrupt(FILE, format!("record {i} out of order")));
            }
            previous = Some(cid);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn record(&self, i: usize) -> &[u8] {
        let len = record_len(self.key_width);
        let start = HEADER_LEN + FAN_OUT_LEN + i * len;
        &self.data.as_ref()[start..start + len]
    }

    fn record_cid(&self, i: usize) -> ColumnarResult<&[u8]> {
        let record = self.record(i);
        let len = record[0] as usize;
        if len == 0 || len > self.key_width {
            return Err(ColumnarError::corrupt(FILE, format!("record {i}: bad cid length {len}")));
        }
        Ok(&record[1..1 + len])
    }

    /// Decode record `i`.
    pub fn entry(&self, i: usize) -> ColumnarResult<IndexEntry> {
        if i >= self.count {
            return Err(ColumnarError::corrupt(FILE, format!("record {i} out of range")));
        }
        let cid = Cid::try_from(self.record_cid(i)?)
            .map_err(|e| ColumnarError::corrupt(FILE, format!("record {i}: {e}")))?;
        let mut frame = Frame::new(&self.record(i)[1 + self.key_width..], FILE);
        Ok(IndexEntry {
            cid,
            bucket: frame.u32()?,
            segment: frame.u32()?,
            row: frame.u32()?,
        })
    }

    /// Find a block's location.
    pub fn lookup(&self, cid: &Cid) -> ColumnarResult<Option<IndexEntry>> {
        let target = cid.to_bytes();
        if target.len() > self.key_width {
            return Ok(None);
        }
        let first = target[0] as usize;
        let mut lo = if first == 0 {
            0
        } else {
            self.fan_out[first - 1] as usize
        };
        let mut hi = self.fan_out[first] as usize;

        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.record_cid(mid)?.cmp(target.as_slice()) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return self.entry(mid).map(Some),
            }
        }
        Ok(None)
    }

    /// Every entry in CID byte order.
    pub fn iter(&self) -> impl Iterator<Item = ColumnarResult<IndexEntry>> + '_ {
        (0..self.count).map(move |i| self.entry(i))
    }

    /// Every CID in byte order. Records were validated by
    /// [`Index::parse`], so none are skipped.
    pub fn cids(&self) -> impl Iterator<Item = Cid> + '_ {
        (0..self.count).filter_map(move |i| self.entry(i).ok().map(|e| e.cid))
    }
}

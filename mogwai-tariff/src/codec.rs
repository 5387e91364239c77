//! Binary tariff persistence
//!
//! Self-describing little-endian encoding. The outer structure is the magic
//! string `"Mogwai tariff"`, a `u16` format version, and a version-specific
//! payload. A file written on a big-endian machine carries the version with
//! swapped bytes (`0x0100`); readers detect that and byte-swap the payload
//! integers while decoding.
//!
//! Version 1 payload: name (`u16` length + UTF-8 bytes), period count
//! (`u32`), then per period `start_unix: u64`, `end_unix: u64`,
//! `repeat_type: u16`, `repeat_period: u32`, `capacity_limit: u64`.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use tracing::debug;

use crate::error::{TariffError, TariffResult};
use crate::period::{Period, RepeatType};
use crate::tariff::Tariff;

/// Magic string identifying a tariff file
pub const MAGIC: &str = "Mogwai tariff";

/// Current format version
pub const VERSION: u16 = 0x0001;

const VERSION_SWAPPED: u16 = VERSION.swap_bytes();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

/// Cursor over encoded tariff bytes, decoding integers in the detected
/// byte order.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            order: ByteOrder::Little,
        }
    }

    fn take(&mut self, len: usize) -> TariffResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| TariffError::InvalidTariff("truncated tariff data".to_string()))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self) -> TariffResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> TariffResult<u16> {
        let bytes: [u8; 2] = self.take(2)?.try_into().unwrap();
        Ok(match self.order {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        })
    }

    fn read_u32(&mut self) -> TariffResult<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(match self.order {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        })
    }

    fn read_u64(&mut self) -> TariffResult<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(match self.order {
            ByteOrder::Little => u64::from_le_bytes(bytes),
            ByteOrder::Big => u64::from_be_bytes(bytes),
        })
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn timestamp_to_instant(unix: u64) -> TariffResult<DateTime<Utc>> {
    let secs = i64::try_from(unix)
        .map_err(|_| TariffError::InvalidTariff(format!("timestamp {unix} out of range")))?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| TariffError::InvalidTariff(format!("timestamp {unix} out of range")))
}

fn instant_to_timestamp(at: DateTime<Utc>) -> u64 {
    // Period construction cannot produce pre-epoch instants from this
    // codec, but hand-built tariffs could; saturate rather than wrap.
    u64::try_from(at.timestamp()).unwrap_or(0)
}

/// Decode a tariff from its binary encoding.
///
/// Rejects bad magic, unknown versions, malformed or trailing payload
/// bytes, and any period or tariff invariant violation.
pub fn decode_tariff(bytes: &[u8]) -> TariffResult<Tariff> {
    let mut reader = Reader::new(bytes);

    let magic_len = reader.read_u8()? as usize;
    let magic = reader.take(magic_len)?;
    if magic != MAGIC.as_bytes() {
        return Err(TariffError::InvalidTariff(
            "magic string mismatch".to_string(),
        ));
    }

    // The version field doubles as the byte-order probe.
    match reader.read_u16()? {
        VERSION => {}
        VERSION_SWAPPED => reader.order = ByteOrder::Big,
        version => {
            return Err(TariffError::InvalidTariff(format!(
                "unsupported tariff version {version:#06x}"
            )));
        }
    }

    let name_len = reader.read_u16()? as usize;
    let name = std::str::from_utf8(reader.take(name_len)?)
        .map_err(|_| TariffError::InvalidTariff("tariff name is not UTF-8".to_string()))?
        .to_string();

    let count = reader.read_u32()?;
    let mut periods = Vec::with_capacity(count.min(1024) as usize);
    for _ in 0..count {
        let start = timestamp_to_instant(reader.read_u64()?)?;
        let end = timestamp_to_instant(reader.read_u64()?)?;
        let repeat_raw = reader.read_u16()?;
        let repeat_type = RepeatType::from_u16(repeat_raw).ok_or_else(|| {
            TariffError::InvalidTariff(format!("unknown repeat type {repeat_raw}"))
        })?;
        let repeat_period = reader.read_u32()?;
        let capacity_limit = reader.read_u64()?;
        periods.push(Period::new(
            start,
            end,
            repeat_type,
            repeat_period,
            capacity_limit,
        )?);
    }

    if reader.remaining() != 0 {
        return Err(TariffError::InvalidTariff(format!(
            "{} trailing bytes after tariff payload",
            reader.remaining()
        )));
    }

    let tariff = Tariff::new(name, periods)?;
    debug!(name = tariff.name(), periods = tariff.periods().len(), "decoded tariff");
    Ok(tariff)
}

/// Encode a tariff in the canonical (little-endian) byte order.
///
/// Fails with [`TariffError::InvalidTariff`] when the name does not fit
/// the wire format's length field.
pub fn encode_tariff(tariff: &Tariff) -> TariffResult<Vec<u8>> {
    let name_len = u16::try_from(tariff.name().len()).map_err(|_| {
        TariffError::InvalidTariff(format!(
            "tariff name is {} bytes, longer than the format allows",
            tariff.name().len()
        ))
    })?;
    let mut out = Vec::new();
    out.push(MAGIC.len() as u8);
    out.extend_from_slice(MAGIC.as_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&name_len.to_le_bytes());
    out.extend_from_slice(tariff.name().as_bytes());
    out.extend_from_slice(&(tariff.periods().len() as u32).to_le_bytes());
    for period in tariff.periods() {
        out.extend_from_slice(&instant_to_timestamp(period.start()).to_le_bytes());
        out.extend_from_slice(&instant_to_timestamp(period.end()).to_le_bytes());
        out.extend_from_slice(&period.repeat_type().as_u16().to_le_bytes());
        out.extend_from_slice(&period.repeat_period().to_le_bytes());
        out.extend_from_slice(&period.capacity_limit().to_le_bytes());
    }
    Ok(out)
}

/// Loads tariffs from their binary encoding, holding at most one at a time.
///
/// Loading is idempotent: each call drops any previously loaded tariff
/// before decoding, so a failed load leaves the loader empty.
#[derive(Debug, Default)]
pub struct TariffLoader {
    tariff: Option<Tariff>,
}

impl TariffLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes` and store the result.
    pub fn load_from_bytes(&mut self, bytes: &[u8]) -> TariffResult<()> {
        self.tariff = None;
        self.tariff = Some(decode_tariff(bytes)?);
        Ok(())
    }

    /// Read and decode a tariff file.
    pub fn load_from_file(&mut self, path: &Path) -> TariffResult<()> {
        let bytes = std::fs::read(path)?;
        self.load_from_bytes(&bytes)
    }

    /// The most recently loaded tariff, if any.
    pub fn tariff(&self) -> Option<&Tariff> {
        self.tariff.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::period::CAPACITY_UNLIMITED;

    fn sample_tariff() -> Tariff {
        let p1 = Period::new(
            "2018-01-22T00:00:00Z".parse().unwrap(),
            "2018-02-22T00:00:00Z".parse().unwrap(),
            RepeatType::None,
            0,
            CAPACITY_UNLIMITED,
        )
        .unwrap();
        let p2 = Period::new(
            "2018-01-01T02:00:00Z".parse().unwrap(),
            "2018-01-01T06:00:00Z".parse().unwrap(),
            RepeatType::Day,
            1,
            2 * 1024 * 1024 * 1024,
        )
        .unwrap();
        Tariff::new("sample", vec![p1, p2]).unwrap()
    }

    /// Byte-swap every integer field of a canonically encoded tariff,
    /// simulating a file written on a big-endian machine.
    fn byte_swapped(tariff: &Tariff) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(MAGIC.len() as u8);
        out.extend_from_slice(MAGIC.as_bytes());
        out.extend_from_slice(&VERSION.to_be_bytes());
        out.extend_from_slice(&(tariff.name().len() as u16).to_be_bytes());
        out.extend_from_slice(tariff.name().as_bytes());
        out.extend_from_slice(&(tariff.periods().len() as u32).to_be_bytes());
        for period in tariff.periods() {
            out.extend_from_slice(&instant_to_timestamp(period.start()).to_be_bytes());
            out.extend_from_slice(&instant_to_timestamp(period.end()).to_be_bytes());
            out.extend_from_slice(&period.repeat_type().as_u16().to_be_bytes());
            out.extend_from_slice(&period.repeat_period().to_be_bytes());
            out.extend_from_slice(&period.capacity_limit().to_be_bytes());
        }
        out
    }

    #[test]
    fn round_trip_preserves_tariff() {
        let tariff = sample_tariff();
        let decoded = decode_tariff(&encode_tariff(&tariff).unwrap()).unwrap();
        assert_eq!(decoded, tariff);
    }

    #[test]
    fn byte_swapped_input_decodes() {
        let tariff = sample_tariff();
        let decoded = decode_tariff(&byte_swapped(&tariff)).unwrap();
        assert_eq!(decoded, tariff);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = encode_tariff(&sample_tariff()).unwrap();
        bytes[1] = b'X';
        assert!(matches!(
            decode_tariff(&bytes),
            Err(TariffError::InvalidTariff(_))
        ));
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = encode_tariff(&sample_tariff()).unwrap();
        let version_at = 1 + MAGIC.len();
        bytes[version_at] = 0x02;
        assert!(matches!(
            decode_tariff(&bytes),
            Err(TariffError::InvalidTariff(_))
        ));
    }

    #[test]
    fn rejects_trailing_bytes() {
        let mut bytes = encode_tariff(&sample_tariff()).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_tariff(&bytes),
            Err(TariffError::InvalidTariff(_))
        ));
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = encode_tariff(&sample_tariff()).unwrap();
        assert!(decode_tariff(&bytes[..bytes.len() - 4]).is_err());
    }

    #[test]
    fn rejects_unknown_repeat_type() {
        let p = sample_tariff();
        let mut bytes = encode_tariff(&p).unwrap();
        // repeat_type of the first period sits after magic, version, name
        // header and the two u64 timestamps.
        let offset = 1 + MAGIC.len() + 2 + 2 + p.name().len() + 4 + 8 + 8;
        bytes[offset] = 0xff;
        assert!(matches!(
            decode_tariff(&bytes),
            Err(TariffError::InvalidTariff(_))
        ));
    }

    #[test]
    fn rejects_invalid_period_values() {
        // end before start
        let mut out = Vec::new();
        out.push(MAGIC.len() as u8);
        out.extend_from_slice(MAGIC.as_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(b"bad!");
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&2000u64.to_le_bytes());
        out.extend_from_slice(&1000u64.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&u64::MAX.to_le_bytes());
        assert!(matches!(
            decode_tariff(&out),
            Err(TariffError::InvalidPeriod(_))
        ));
    }

    #[test]
    fn loader_is_idempotent() {
        let mut loader = TariffLoader::new();
        loader.load_from_bytes(&encode_tariff(&sample_tariff()).unwrap()).unwrap();
        assert_eq!(loader.tariff().unwrap().name(), "sample");

        let other = Tariff::new(
            "other",
            vec![Period::new(
                "2019-01-01T00:00:00Z".parse().unwrap(),
                "2019-02-01T00:00:00Z".parse().unwrap(),
                RepeatType::None,
                0,
                CAPACITY_UNLIMITED,
            )
            .unwrap()],
        )
        .unwrap();
        loader.load_from_bytes(&encode_tariff(&other).unwrap()).unwrap();
        assert_eq!(loader.tariff().unwrap().name(), "other");
    }

    #[test]
    fn failed_load_leaves_loader_empty() {
        let mut loader = TariffLoader::new();
        loader.load_from_bytes(&encode_tariff(&sample_tariff()).unwrap()).unwrap();
        assert!(loader.load_from_bytes(b"garbage").is_err());
        assert!(loader.tariff().is_none());
    }
}

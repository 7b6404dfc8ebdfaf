//! Decoder for the binary scenario file format: a fixed-layout header
//! followed by time-indexed groups of per-link quality records.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use super::error::{Result, ScenarioError};

/// On-disk scenario header: signature plus version and sizing fields.
///
/// All fields are little-endian `i32`s following a 4-byte ASCII signature;
/// every field is naturally 4-byte aligned so no explicit packing is
/// required.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct ScenarioHeader {
    pub signature: [u8; 4],
    pub major: i32,
    pub minor: i32,
    pub subminor: i32,
    pub revision: i32,
    pub interface_count: i32,
    pub time_record_count: i32,
}

/// One scenario tick's timestamp and the number of [`LinkRecord`]s that follow.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct TimeRecord {
    pub time: f32,
    pub record_count: i32,
}

/// A single per-link quality sample within a tick.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct LinkRecord {
    pub from_id: i32,
    pub to_id: i32,
    pub frame_error_rate: f32,
    pub num_retransmissions: f32,
    pub standard: i32,
    pub operating_rate: f32,
    /// Bits per second. `-1.0` means "undefined" (map to the configured default).
    pub bandwidth: f32,
    /// Fraction in `[0, 1]`.
    pub loss_rate: f32,
    /// Seconds.
    pub delay: f32,
}

impl LinkRecord {
    /// `bandwidth == -1.0` sentinel.
    pub fn bandwidth_is_undefined(&self) -> bool {
        self.bandwidth == -1.0
    }
}

const HEADER_SIZE: usize = std::mem::size_of::<ScenarioHeader>();
const TIME_RECORD_SIZE: usize = std::mem::size_of::<TimeRecord>();
const LINK_RECORD_SIZE: usize = std::mem::size_of::<LinkRecord>();

/// Buffered reader over a scenario file.
///
/// Exposes `read_header`/`read_time_record`/`read_records` as the three
/// primitive decode operations, plus `rewind_to_data_start` for loop/restart
/// and an `iter_ticks` convenience built on top of them (no new wire
/// behavior, just ergonomics for the player and for tests).
pub struct ScenarioReader {
    file: BufReader<File>,
    header: ScenarioHeader,
    data_start: u64,
}

impl ScenarioReader {
    /// Open `path`, decode and validate the header, and position the
    /// cursor at the start of the first tick's data.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = BufReader::new(File::open(path)?);
        let header = Self::decode_header(&mut file)?;
        let data_start = file.stream_position()?;

        Ok(Self {
            file,
            header,
            data_start,
        })
    }

    /// The header decoded at open time.
    pub fn header(&self) -> &ScenarioHeader {
        &self.header
    }

    fn decode_header(file: &mut BufReader<File>) -> Result<ScenarioHeader> {
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ScenarioError::Truncated {
                    expected: HEADER_SIZE,
                    actual: 0,
                }
            } else {
                ScenarioError::Io(e)
            }
        })?;

        let header = ScenarioHeader::read_from_bytes(&buf)
            .map_err(|_| ScenarioError::InvalidHeader("malformed header".into()))?;

        if header.interface_count < 2 {
            return Err(ScenarioError::InvalidCount {
                field: "interface_count",
                value: header.interface_count as i64,
            });
        }
        if header.time_record_count < 1 {
            return Err(ScenarioError::InvalidCount {
                field: "time_record_count",
                value: header.time_record_count as i64,
            });
        }

        Ok(header)
    }

    /// Re-read the header (used by `read_header` for callers that want to
    /// re-inspect it mid-stream; normal use should prefer [`Self::header`]).
    pub fn read_header(&mut self) -> Result<ScenarioHeader> {
        Ok(self.header)
    }

    /// Read the next `TimeRecord`.
    pub fn read_time_record(&mut self) -> Result<TimeRecord> {
        let mut buf = [0u8; TIME_RECORD_SIZE];
        self.file.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ScenarioError::Truncated {
                    expected: TIME_RECORD_SIZE,
                    actual: 0,
                }
            } else {
                ScenarioError::Io(e)
            }
        })?;
        TimeRecord::read_from_bytes(&buf)
            .map_err(|_| ScenarioError::InvalidHeader("malformed time record".into()))
    }

    /// Read `n` consecutive `LinkRecord`s.
    ///
    /// Callers pass the raw `i32` `record_count` off a tick header, which
    /// may be negative or absurdly large in a crafted file; validate it as
    /// a signed count before it is ever cast to `usize`, so a hostile value
    /// is rejected rather than wrapping into a runaway allocation.
    pub fn read_records(&mut self, n: i32) -> Result<Vec<LinkRecord>> {
        let max = self.header.interface_count as i64 * (self.header.interface_count as i64 - 1);
        if n < 0 || n as i64 > max {
            return Err(ScenarioError::InvalidCount {
                field: "record_count",
                value: n as i64,
            });
        }
        let n = n as usize;

        let mut records = Vec::with_capacity(n);
        let mut buf = [0u8; LINK_RECORD_SIZE];
        for _ in 0..n {
            self.file.read_exact(&mut buf).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    ScenarioError::Truncated {
                        expected: LINK_RECORD_SIZE,
                        actual: 0,
                    }
                } else {
                    ScenarioError::Io(e)
                }
            })?;
            let record = LinkRecord::read_from_bytes(&buf)
                .map_err(|_| ScenarioError::InvalidHeader("malformed link record".into()))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Seek back to the first tick, for loop mode and `SIGUSR1` restarts.
    pub fn rewind_to_data_start(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.data_start))?;
        Ok(())
    }

    /// Iterate every tick in file order as `(TimeRecord, Vec<LinkRecord>)`.
    pub fn iter_ticks(&mut self) -> TickIter<'_> {
        TickIter {
            reader: self,
            remaining: None,
        }
    }
}

/// Iterator over scenario ticks, built on [`ScenarioReader::read_time_record`]
/// and [`ScenarioReader::read_records`].
pub struct TickIter<'a> {
    reader: &'a mut ScenarioReader,
    remaining: Option<i32>,
}

impl<'a> Iterator for TickIter<'a> {
    type Item = Result<(TimeRecord, Vec<LinkRecord>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.remaining.get_or_insert(self.reader.header.time_record_count);
        if *remaining <= 0 {
            return None;
        }
        *remaining -= 1;

        let time_record = match self.reader.read_time_record() {
            Ok(t) => t,
            Err(e) => return Some(Err(e)),
        };
        let records = match self.reader.read_records(time_record.record_count) {
            Ok(r) => r,
            Err(e) => return Some(Err(e)),
        };
        Some(Ok((time_record, records)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(path: &Path) {
        let mut f = File::create(path).unwrap();
        let header = ScenarioHeader {
            signature: *b"MTR1",
            major: 1,
            minor: 0,
            subminor: 0,
            revision: 1,
            interface_count: 2,
            time_record_count: 1,
        };
        f.write_all(header.as_bytes()).unwrap();

        let time_record = TimeRecord {
            time: 0.0,
            record_count: 1,
        };
        f.write_all(time_record.as_bytes()).unwrap();

        let link = LinkRecord {
            from_id: 1,
            to_id: 0,
            frame_error_rate: 0.0,
            num_retransmissions: 0.0,
            standard: 0,
            operating_rate: 0.0,
            bandwidth: 1_000_000.0,
            loss_rate: 0.1,
            delay: 0.02,
        };
        f.write_all(link.as_bytes()).unwrap();
    }

    #[test]
    fn reads_header_and_single_tick() {
        let dir = std::env::temp_dir();
        let path = dir.join("meteor_core_test_scenario.bin");
        write_fixture(&path);

        let mut reader = ScenarioReader::open(&path).unwrap();
        assert_eq!(reader.header().interface_count, 2);
        assert_eq!(reader.header().time_record_count, 1);

        let ticks: Vec<_> = reader.iter_ticks().collect::<Result<_>>().unwrap();
        assert_eq!(ticks.len(), 1);
        let (time_record, records) = &ticks[0];
        assert_eq!(time_record.record_count, 1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].from_id, 1);
        assert_eq!(records[0].to_id, 0);
        assert!((records[0].bandwidth - 1_000_000.0).abs() < f32::EPSILON);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_short_header() {
        let dir = std::env::temp_dir();
        let path = dir.join("meteor_core_test_short.bin");
        std::fs::write(&path, [0u8; 4]).unwrap();

        let result = ScenarioReader::open(&path);
        assert!(result.is_err());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rewind_replays_first_tick() {
        let dir = std::env::temp_dir();
        let path = dir.join("meteor_core_test_rewind.bin");
        write_fixture(&path);

        let mut reader = ScenarioReader::open(&path).unwrap();
        let first: Vec<_> = reader.iter_ticks().collect::<Result<_>>().unwrap();

        reader.rewind_to_data_start().unwrap();
        let second: Vec<_> = reader.iter_ticks().collect::<Result<_>>().unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].1[0].from_id, second[0].1[0].from_id);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn negative_record_count_is_rejected_without_allocating() {
        let dir = std::env::temp_dir();
        let path = dir.join("meteor_core_test_negative_count.bin");
        write_fixture(&path);

        let mut reader = ScenarioReader::open(&path).unwrap();
        let result = reader.read_records(-1);
        assert!(matches!(result, Err(ScenarioError::InvalidCount { field: "record_count", .. })));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn oversized_record_count_is_rejected() {
        let dir = std::env::temp_dir();
        let path = dir.join("meteor_core_test_oversized_count.bin");
        write_fixture(&path);

        let mut reader = ScenarioReader::open(&path).unwrap();
        let result = reader.read_records(i32::MAX);
        assert!(matches!(result, Err(ScenarioError::InvalidCount { field: "record_count", .. })));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn bandwidth_sentinel_detected() {
        let undefined = LinkRecord {
            from_id: 0,
            to_id: 1,
            frame_error_rate: 0.0,
            num_retransmissions: 0.0,
            standard: 0,
            operating_rate: 0.0,
            bandwidth: -1.0,
            loss_rate: 0.0,
            delay: 0.0,
        };
        assert!(undefined.bandwidth_is_undefined());
    }
}

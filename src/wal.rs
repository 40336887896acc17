use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Event;

/// Append-only event log backing the engine's in-memory state.
///
/// Each record is an 8-byte header followed by the payload:
/// `[u32: payload len][u32: crc32 of payload][bincode: Event]`.
/// A crash can only damage the tail; `load` stops at the first record whose
/// header, length, or checksum does not hold, and everything before it is
/// intact.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    since_rewrite: u64,
}

fn frame(out: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    out.write_all(&payload)
}

/// Next payload from the reader, or `None` at end of log. A truncated or
/// checksum-failing record also reads as end of log.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 8];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
    let expected_crc = u32::from_le_bytes(header[4..].try_into().unwrap());

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    if crc32fast::hash(&payload) != expected_crc {
        return Ok(None);
    }
    Ok(Some(payload))
}

impl Wal {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            since_rewrite: 0,
        })
    }

    /// Stage an event in the write buffer. Nothing is durable until the next
    /// `commit`; the group-commit writer buffers a whole batch and syncs once.
    pub fn buffer(&mut self, event: &Event) -> io::Result<()> {
        frame(&mut self.writer, event)?;
        self.since_rewrite += 1;
        Ok(())
    }

    /// Flush buffered records and fsync.
    pub fn commit(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Events appended since the log was last rewritten. The compactor uses
    /// this as its trigger.
    pub fn events_since_rewrite(&self) -> u64 {
        self.since_rewrite
    }

    /// Replace the log with the given events: write them to a sibling temp
    /// file, fsync it, then rename over the live log and reopen. Readers of a
    /// crashed rewrite see either the old log or the new one, never a mix.
    pub fn rewrite(&mut self, events: &[Event]) -> io::Result<()> {
        let staged = self.path.with_extension("wal.tmp");
        let mut out = BufWriter::new(File::create(&staged)?);
        for event in events {
            frame(&mut out, event)?;
        }
        out.flush()?;
        out.get_ref().sync_all()?;

        fs::rename(&staged, &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.since_rewrite = 0;
        Ok(())
    }

    /// Read every intact event from the log at `path`. A missing file is an
    /// empty log; a damaged tail is dropped.
    pub fn load(path: &Path) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        while let Some(payload) = read_frame(&mut reader)? {
            match bincode::deserialize::<Event>(&payload) {
                Ok(event) => events.push(event),
                Err(_) => break,
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Slot, SlotTime};
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn t(s: &str) -> SlotTime {
        s.parse().unwrap()
    }

    fn registered() -> Event {
        Event::TutorRegistered { id: Ulid::new() }
    }

    fn day_set(tutor: Ulid) -> Event {
        Event::AvailabilitySet {
            tutor,
            date: "2025-07-20".parse::<NaiveDate>().unwrap(),
            slots: vec![
                Slot::free(t("09:00"), t("10:00")),
                Slot::free(t("10:00"), t("11:00")),
            ],
        }
    }

    fn write_all(path: &Path, events: &[Event]) {
        let mut wal = Wal::open(path).unwrap();
        for e in events {
            wal.buffer(e).unwrap();
        }
        wal.commit().unwrap();
    }

    #[test]
    fn buffered_events_survive_commit_and_load() {
        let path = tmp_path("roundtrip.wal");
        let tutor = Ulid::new();
        let events = vec![Event::TutorRegistered { id: tutor }, day_set(tutor)];

        write_all(&path, &events);
        assert_eq!(Wal::load(&path).unwrap(), events);
    }

    #[test]
    fn missing_log_reads_empty() {
        assert!(Wal::load(&tmp_path("missing.wal")).unwrap().is_empty());
    }

    #[test]
    fn torn_tail_is_dropped() {
        let path = tmp_path("torn.wal");
        let keep = registered();
        write_all(&path, std::slice::from_ref(&keep));

        // a crash mid-append leaves a partial header on disk
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[7, 0, 0]).unwrap();

        assert_eq!(Wal::load(&path).unwrap(), vec![keep]);
    }

    #[test]
    fn checksum_mismatch_ends_the_log() {
        let path = tmp_path("badsum.wal");
        let keep = registered();
        write_all(&path, std::slice::from_ref(&keep));

        // valid header, flipped payload byte
        let payload = bincode::serialize(&registered()).unwrap();
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
        f.write_all(&crc32fast::hash(&payload).to_le_bytes()).unwrap();
        let mut corrupted = payload;
        corrupted[0] ^= 0xFF;
        f.write_all(&corrupted).unwrap();

        assert_eq!(Wal::load(&path).unwrap(), vec![keep]);
    }

    #[test]
    fn rewrite_shrinks_and_resets_counter() {
        let path = tmp_path("rewrite.wal");
        let tutor = Ulid::new();

        let mut wal = Wal::open(&path).unwrap();
        wal.buffer(&Event::TutorRegistered { id: tutor }).unwrap();
        for _ in 0..10 {
            wal.buffer(&day_set(tutor)).unwrap();
            wal.buffer(&Event::AvailabilitySet {
                tutor,
                date: "2025-07-20".parse().unwrap(),
                slots: Vec::new(),
            })
            .unwrap();
        }
        wal.commit().unwrap();
        assert_eq!(wal.events_since_rewrite(), 21);
        let before = fs::metadata(&path).unwrap().len();

        let minimal = vec![Event::TutorRegistered { id: tutor }];
        wal.rewrite(&minimal).unwrap();

        assert_eq!(wal.events_since_rewrite(), 0);
        let after = fs::metadata(&path).unwrap().len();
        assert!(after < before, "rewrite should shrink the log: {after} < {before}");
        assert_eq!(Wal::load(&path).unwrap(), minimal);
    }

    #[test]
    fn appends_after_rewrite_land_in_the_new_log() {
        let path = tmp_path("rewrite_append.wal");
        let tutor = Ulid::new();
        let base = Event::TutorRegistered { id: tutor };
        let added = day_set(tutor);

        let mut wal = Wal::open(&path).unwrap();
        wal.buffer(&base).unwrap();
        wal.commit().unwrap();
        wal.rewrite(std::slice::from_ref(&base)).unwrap();
        wal.buffer(&added).unwrap();
        wal.commit().unwrap();

        assert_eq!(Wal::load(&path).unwrap(), vec![base, added]);
    }
}

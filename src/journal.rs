//! Durable outbound message journal.
//!
//! While the client is not connected, outbound messages are appended to a file, one
//! JSON object per line. After a reconnect the journal is replayed to the new
//! connection, followed by the in-memory overflow buffer holding messages that were
//! sent while the replay was in progress, and then the file is truncated.

use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead as _, BufReader, Lines, Write as _};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::error::Error;
use crate::transport::Connection;
use crate::types::Message;

/// On-disk representation of one journaled message.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum JournalEntry {
    Text(String),
    /// Base64 encoded payload
    Binary(String),
}

impl From<&Message> for JournalEntry {
    fn from(message: &Message) -> Self {
        match message {
            Message::Text(text) => Self::Text(text.clone()),
            Message::Binary(bytes) => Self::Binary(STANDARD.encode(bytes)),
        }
    }
}

impl TryFrom<JournalEntry> for Message {
    type Error = Error;

    fn try_from(entry: JournalEntry) -> Result<Self> {
        Ok(match entry {
            JournalEntry::Text(text) => Message::Text(text),
            JournalEntry::Binary(encoded) => Message::Binary(STANDARD.decode(encoded)?),
        })
    }
}

/// Outcome of one [`MessageJournal::drain_to`] step.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainProgress {
    /// The step budget ran out before the journal was empty
    Pending,
    /// Every durable entry and every overflow message was written and the file truncated
    Complete {
        /// Messages written over the whole drain, overflow included
        replayed: usize,
    },
}

struct Replay {
    lines: Lines<BufReader<File>>,
    replayed: usize,
}

/// Append-only file of messages queued while disconnected, plus the overflow buffer.
pub struct MessageJournal {
    path: PathBuf,
    file: File,
    overflow: VecDeque<Message>,
    replay: Option<Replay>,
}

impl MessageJournal {
    /// Open (or create) the journal at `path`, creating parent directories as needed.
    ///
    /// Entries left over from a previous run are kept and replayed on the next reconnect.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| Error::journal(path.clone(), e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::journal(path.clone(), e))?;

        Ok(Self {
            path,
            file,
            overflow: VecDeque::new(),
            replay: None,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `message` to the durable log.
    pub fn append(&mut self, message: &Message) -> Result<()> {
        let mut line = serde_json::to_string(&JournalEntry::from(message))?;
        line.push('\n');

        self.file
            .write_all(line.as_bytes())
            .and_then(|()| self.file.flush())
            .map_err(|e| self.io_error(e))
    }

    /// Queue `message` in memory while a replay is in progress.
    pub fn push_overflow(&mut self, message: Message) {
        self.overflow.push_back(message);
    }

    pub fn pop_overflow(&mut self) -> Option<Message> {
        self.overflow.pop_front()
    }

    #[must_use]
    pub fn overflow_len(&self) -> usize {
        self.overflow.len()
    }

    /// Whether the durable log holds no entries.
    pub fn is_empty(&self) -> Result<bool> {
        let metadata = self.file.metadata().map_err(|e| self.io_error(e))?;
        Ok(metadata.len() == 0)
    }

    /// Read every durable entry without consuming it.
    pub fn entries(&self) -> Result<Vec<Message>> {
        let reader = File::open(&self.path).map_err(|e| self.io_error(e))?;
        let mut messages = Vec::new();
        for line in BufReader::new(reader).lines() {
            let line = line.map_err(|e| self.io_error(e))?;
            if let Some(message) = decode_line(&line) {
                messages.push(message);
            }
        }

        Ok(messages)
    }

    #[must_use]
    pub fn is_replaying(&self) -> bool {
        self.replay.is_some()
    }

    /// Write up to `budget` durable entries to `connection`.
    ///
    /// Once the durable log is exhausted the overflow buffer is flushed and the log is
    /// truncated within the same call, regardless of the budget. Messages pushed to the
    /// overflow buffer between calls are therefore written after every durable entry.
    ///
    /// On error the replay is abandoned and the file left untouched, so the next drain
    /// starts again from the first entry.
    pub fn drain_to<C: Connection + ?Sized>(
        &mut self,
        connection: &mut C,
        budget: usize,
    ) -> Result<DrainProgress> {
        let mut replay = match self.replay.take() {
            Some(replay) => replay,
            None => Replay {
                lines: BufReader::new(File::open(&self.path).map_err(|e| self.io_error(e))?)
                    .lines(),
                replayed: 0,
            },
        };

        let mut sent = 0;
        while sent < budget {
            let Some(line) = replay.lines.next() else {
                while let Some(message) = self.overflow.pop_front() {
                    if let Err(e) = connection.send(&message) {
                        self.overflow.push_front(message);
                        return Err(e);
                    }
                    replay.replayed = replay.replayed.saturating_add(1);
                }
                self.truncate()?;

                return Ok(DrainProgress::Complete {
                    replayed: replay.replayed,
                });
            };

            let line = line.map_err(|e| self.io_error(e))?;
            if let Some(message) = decode_line(&line) {
                connection.send(&message)?;
                replay.replayed = replay.replayed.saturating_add(1);
                sent += 1;
            }
        }

        self.replay = Some(replay);
        Ok(DrainProgress::Pending)
    }

    /// Abandon an in-progress replay and move the overflow buffer onto the durable log.
    ///
    /// Used when the connection drops mid-replay: overflow messages were sent after
    /// everything already journaled, so they must be replayed after it next time.
    pub fn abort_replay(&mut self) -> Result<()> {
        self.replay = None;
        while let Some(message) = self.overflow.pop_front() {
            if let Err(e) = self.append(&message) {
                self.overflow.push_front(message);
                return Err(e);
            }
        }

        Ok(())
    }

    fn truncate(&mut self) -> Result<()> {
        self.file.set_len(0).map_err(|e| self.io_error(e))
    }

    fn io_error(&self, source: io::Error) -> Error {
        Error::journal(self.path.clone(), source)
    }
}

impl std::fmt::Debug for MessageJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageJournal")
            .field("path", &self.path)
            .field("overflow", &self.overflow.len())
            .field("replaying", &self.replay.is_some())
            .finish_non_exhaustive()
    }
}

fn decode_line(line: &str) -> Option<Message> {
    if line.trim().is_empty() {
        return None;
    }

    match serde_json::from_str::<JournalEntry>(line)
        .map_err(Error::from)
        .and_then(Message::try_from)
    {
        Ok(message) => Some(message),
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(%line, error = %e, "Skipping unreadable journal entry");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::env;

    use super::*;

    /// Unique journal path under the system temp directory, removed on drop.
    pub(crate) struct TempJournal(pub PathBuf);

    impl TempJournal {
        pub(crate) fn new() -> Self {
            let dir = env::temp_dir().join(format!("tether-ws-{}", uuid::Uuid::now_v7()));
            Self(dir.join("journal.log"))
        }
    }

    impl Drop for TempJournal {
        fn drop(&mut self) {
            if let Some(dir) = self.0.parent() {
                drop(fs::remove_dir_all(dir));
            }
        }
    }

    #[derive(Default)]
    pub(crate) struct Recorder {
        pub sent: Vec<Message>,
        pub fail_after: Option<usize>,
    }

    impl Connection for Recorder {
        fn send(&mut self, message: &Message) -> Result<()> {
            if self.fail_after.is_some_and(|n| self.sent.len() >= n) {
                return Err(Error::configuration("connection gone"));
            }
            self.sent.push(message.clone());
            Ok(())
        }

        fn close(&mut self) {}
    }

    fn texts(messages: &[Message]) -> Vec<&str> {
        messages.iter().filter_map(Message::as_text).collect()
    }

    #[test]
    fn append_writes_one_line_per_message() {
        let tmp = TempJournal::new();
        let mut journal = MessageJournal::open(&tmp.0).unwrap();

        journal.append(&Message::from("first")).unwrap();
        journal.append(&Message::from("multi\nline")).unwrap();
        journal.append(&Message::from(vec![1_u8, 2, 3])).unwrap();

        let raw = fs::read_to_string(&tmp.0).unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert_eq!(raw.lines().next(), Some(r#"{"text":"first"}"#));
        assert_eq!(raw.lines().nth(2), Some(r#"{"binary":"AQID"}"#));

        let entries = journal.entries().unwrap();
        assert_eq!(entries[1], Message::from("multi\nline"));
        assert_eq!(entries[2], Message::Binary(vec![1, 2, 3]));
    }

    #[test]
    fn drain_replays_in_order_then_overflow_then_truncates() {
        let tmp = TempJournal::new();
        let mut journal = MessageJournal::open(&tmp.0).unwrap();
        for text in ["a", "b", "c", "d", "e"] {
            journal.append(&Message::from(text)).unwrap();
        }
        let mut connection = Recorder::default();

        assert_eq!(
            journal.drain_to(&mut connection, 2).unwrap(),
            DrainProgress::Pending
        );
        journal.push_overflow(Message::from("late-1"));
        assert_eq!(
            journal.drain_to(&mut connection, 2).unwrap(),
            DrainProgress::Pending
        );
        journal.push_overflow(Message::from("late-2"));
        assert_eq!(
            journal.drain_to(&mut connection, 2).unwrap(),
            DrainProgress::Complete { replayed: 7 }
        );

        assert_eq!(
            texts(&connection.sent),
            vec!["a", "b", "c", "d", "e", "late-1", "late-2"]
        );
        assert!(journal.is_empty().unwrap());
        assert!(!journal.is_replaying());
        assert_eq!(journal.overflow_len(), 0);
    }

    #[test]
    fn appends_after_drain_start_from_empty_file() {
        let tmp = TempJournal::new();
        let mut journal = MessageJournal::open(&tmp.0).unwrap();
        journal.append(&Message::from("old")).unwrap();
        journal.drain_to(&mut Recorder::default(), 16).unwrap();

        journal.append(&Message::from("new")).unwrap();

        assert_eq!(fs::read_to_string(&tmp.0).unwrap(), "{\"text\":\"new\"}\n");
    }

    #[test]
    fn failed_drain_keeps_entries_for_next_attempt() {
        let tmp = TempJournal::new();
        let mut journal = MessageJournal::open(&tmp.0).unwrap();
        for text in ["a", "b", "c"] {
            journal.append(&Message::from(text)).unwrap();
        }
        let mut flaky = Recorder {
            fail_after: Some(1),
            ..Recorder::default()
        };

        journal.drain_to(&mut flaky, 16).unwrap_err();
        journal.push_overflow(Message::from("late"));
        journal.abort_replay().unwrap();

        let entries = journal.entries().unwrap();
        assert_eq!(texts(&entries), vec!["a", "b", "c", "late"]);
        assert_eq!(journal.overflow_len(), 0);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let tmp = TempJournal::new();
        let mut journal = MessageJournal::open(&tmp.0).unwrap();
        journal.append(&Message::from("good")).unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(&tmp.0)
            .unwrap()
            .write_all(b"{\"text\":\"trunc")
            .unwrap();

        let mut connection = Recorder::default();
        journal.drain_to(&mut connection, 16).unwrap();

        assert_eq!(texts(&connection.sent), vec!["good"]);
    }

    #[test]
    fn leftover_entries_survive_reopen() {
        let tmp = TempJournal::new();
        {
            let mut journal = MessageJournal::open(&tmp.0).unwrap();
            journal.append(&Message::from("persisted")).unwrap();
        }

        let journal = MessageJournal::open(&tmp.0).unwrap();
        assert_eq!(journal.entries().unwrap(), vec![Message::from("persisted")]);
    }

    #[test]
    fn unwritable_path_fails_loudly() {
        let tmp = TempJournal::new();
        let dir = tmp.0.parent().unwrap().to_path_buf();
        fs::create_dir_all(&dir).unwrap();
        fs::create_dir_all(&tmp.0).unwrap();

        let err = MessageJournal::open(&tmp.0).unwrap_err();
        assert_eq!(err.kind(), crate::error::Kind::Journal);
    }
}

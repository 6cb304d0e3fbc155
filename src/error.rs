use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Missing or invalid client configuration, surfaced at construction
    Configuration,
    /// Error related to the underlying WebSocket transport
    WebSocket,
    /// The retry schedule was consumed and the client stopped reconnecting
    RetriesExhausted,
    /// The durable journal could not be written or read
    Journal,
    /// Internal error from dependencies
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Configuration {
            reason: message.into(),
        }
        .into()
    }

    #[must_use]
    pub fn retries_exhausted(uri: String, attempts: u32, last_delay: Option<Duration>) -> Self {
        RetriesExhausted {
            uri,
            attempts,
            last_delay,
        }
        .into()
    }

    pub fn journal(path: PathBuf, source: io::Error) -> Self {
        JournalWrite { path, source }.into()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Configuration {
    pub reason: String,
}

impl fmt::Display for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.reason)
    }
}

impl StdError for Configuration {}

/// The client consumed its whole retry schedule without reaching the server.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetriesExhausted {
    /// The endpoint that could not be reached
    pub uri: String,
    /// Number of failed attempts since the last successful connection
    pub attempts: u32,
    /// The final delay of the schedule, if it had any entries
    pub last_delay: Option<Duration>,
}

impl fmt::Display for RetriesExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "exhausted the retry schedule after {} attempts, the server at {} is not reachable",
            self.attempts, self.uri
        )
    }
}

impl StdError for RetriesExhausted {}

/// A journal operation failed, so the durability guarantee no longer holds.
#[non_exhaustive]
#[derive(Debug)]
pub struct JournalWrite {
    pub path: PathBuf,
    pub source: io::Error,
}

impl fmt::Display for JournalWrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unable to write journal at {}: {}",
            self.path.display(),
            self.source
        )
    }
}

impl StdError for JournalWrite {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&self.source)
    }
}

impl From<Configuration> for Error {
    fn from(err: Configuration) -> Self {
        Error::with_source(Kind::Configuration, err)
    }
}

impl From<RetriesExhausted> for Error {
    fn from(err: RetriesExhausted) -> Self {
        Error::with_source(Kind::RetriesExhausted, err)
    }
}

impl From<JournalWrite> for Error {
    fn from(err: JournalWrite) -> Self {
        Error::with_source(Kind::Journal, err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Configuration, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_exhausted_display_should_succeed() {
        let exhausted = RetriesExhausted {
            uri: "ws://localhost:9000/".to_owned(),
            attempts: 3,
            last_delay: Some(Duration::from_secs(5)),
        };

        assert_eq!(
            exhausted.to_string(),
            "exhausted the retry schedule after 3 attempts, the server at ws://localhost:9000/ is not reachable"
        );
    }

    #[test]
    fn retries_exhausted_into_error_should_succeed() {
        let error = Error::retries_exhausted("ws://localhost/".to_owned(), 4, None);

        assert_eq!(error.kind(), Kind::RetriesExhausted);
        let inner = error.downcast_ref::<RetriesExhausted>().unwrap();
        assert_eq!(inner.attempts, 4);
    }

    #[test]
    fn journal_error_exposes_io_source() {
        let error = Error::journal(
            PathBuf::from("/nowhere/journal.log"),
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        );

        assert_eq!(error.kind(), Kind::Journal);
        assert!(error.to_string().contains("/nowhere/journal.log"));
        let journal = error.downcast_ref::<JournalWrite>().unwrap();
        assert_eq!(journal.source.kind(), io::ErrorKind::PermissionDenied);
    }

    #[test]
    fn configuration_error_should_succeed() {
        let error = Error::configuration("uri is required");

        assert_eq!(error.kind(), Kind::Configuration);
        assert_eq!(
            error.to_string(),
            "Configuration: invalid configuration: uri is required"
        );
    }
}

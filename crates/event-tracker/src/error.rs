use event_tracker_core::{ConfigError, IdentityError};
use snafu::{Location, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TrackError {
    #[snafu(transparent)]
    Identity {
        source: IdentityError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("key limit of {max_keys} reached"))]
    KeyLimitReached {
        max_keys: u64,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Storage {
        source: StorageError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(transparent)]
    Config {
        source: ConfigError,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type TrackResult<T> = Result<T, TrackError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("backing store unavailable: {message}"))]
    Unavailable {
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("record for key {key} was corrupt and could not be decoded: {message}"))]
    Corrupt {
        key: String,
        message: String,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("write to key {key} was lost to a concurrent writer after {attempts} attempts"))]
    LostUpdate {
        key: String,
        attempts: u32,
        #[snafu(implicit)]
        location: Location,
    },
}

pub type StorageResult<T> = Result<T, StorageError>;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("device I/O failed")]
    Io,
    #[error("no valid boot region on the volume")]
    InvalidBootRegion,
    #[error("boot sector field violates a structural invariant")]
    InvalidGeometry,
    #[error("volume is out of free clusters")]
    OutOfSpace,
    #[error("cluster {0} is outside the valid heap range")]
    InvalidCluster(u32),
    #[error("FAT chain does not terminate")]
    ChainCycle,
    #[error("directory entry set failed validation")]
    InvalidEntrySet,
    #[error("access beyond the end of the stream")]
    OutOfBounds,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("not a directory")]
    NotDirectory,
    #[error("not a regular file")]
    NotFile,
    #[error("directory is not empty")]
    NotEmpty,
    #[error("invalid file name")]
    InvalidFileName,
    #[error("required volume metadata entry is missing")]
    MissingMetadata,
    #[error("invalid build parameters")]
    InvalidParams,
    #[error("device too small for the requested layout")]
    VolumeTooSmall,
}

pub type Result<T> = core::result::Result<T, FsError>;

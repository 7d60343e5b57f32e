//! Concrete operations for Linux hosts
//!
//! Every operation here implements [`declarative::Operation`]: it probes the
//! host through a [`declarative::FactProbe`] and converges through a
//! [`declarative::HostExecutor`]. None of them touch the local machine
//! except [`FetchFile`].

pub mod boot;
pub mod command;
pub mod disk;
pub mod file;
pub mod git;
pub mod mount;
pub mod package;
pub mod service;
pub mod system;
pub mod zfs;

pub use boot::KernelParams;
pub use command::{Command, Condition, Download};
pub use disk::{WipeDisk, is_protected_device};
pub use file::{Directory, FetchFile, FileContent, FileReplace, LineInFile};
pub use git::GitRepo;
pub use mount::Mounted;
pub use package::{AptPackages, AptRepo, PipPackages};
pub use service::ServiceState;
pub use system::{KernelModule, Sysctl};
pub use zfs::{ZfsDataset, ZfsPool};

/// Largest file shown in full in probe details
const INLINE_LIMIT: usize = 16 * 1024;

/// Quote a string for POSIX `sh`
pub fn quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Short content fingerprint
pub fn fingerprint(content: &[u8]) -> String {
    let hash = blake3::hash(content).to_hex();
    format!("blake3:{}", &hash[..16])
}

/// Render file content for probe details
///
/// Small text files are shown in full so `plan` can print a line diff;
/// anything else is summarized by size and fingerprint.
pub fn describe_content(content: &[u8]) -> String {
    match std::str::from_utf8(content) {
        Ok(text) if content.len() <= INLINE_LIMIT => text.to_string(),
        _ => format!("{} ({} bytes)", fingerprint(content), content.len()),
    }
}

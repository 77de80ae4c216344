//! Resource specifications — one typed descriptor per desired artifact.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// An apt source list written to `sources.list.d/<name>.list`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceList {
    pub name: String,
    /// `deb ...` lines, one per entry.
    pub entries: Vec<String>,
}

impl SourceList {
    pub fn file_name(&self) -> String {
        format!("{}.list", self.name)
    }

    /// File content as written to disk.
    pub fn render(&self) -> String {
        let mut content = self.entries.join("\n");
        content.push('\n');
        content
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Package {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// `name=version` when pinned, otherwise the bare name.
    pub fn qualified_name(&self) -> String {
        match &self.version {
            Some(version) => format!("{}={}", self.name, version),
            None => self.name.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directory {
    pub path: PathBuf,
    /// Octal permission string, e.g. `"0755"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl Directory {
    pub fn mode_bits(&self) -> Result<Option<u32>> {
        parse_mode(self.mode.as_deref())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub source: PathBuf,
    pub destination: PathBuf,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl Template {
    pub fn mode_bits(&self) -> Result<Option<u32>> {
        parse_mode(self.mode.as_deref())
    }
}

/// A personal package archive, e.g. `nginx/stable`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageArchive {
    pub name: String,
}

impl PackageArchive {
    pub fn repository(&self) -> String {
        format!("ppa:{}", self.name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tarball {
    pub url: String,
    pub destination: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,
    #[serde(default)]
    pub system: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symlink {
    /// Where the link points.
    pub target: PathBuf,
    /// The link itself.
    pub link: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseUser {
    pub name: String,
    #[serde(default)]
    pub superuser: bool,
}

/// A Ruby dependency bundle installed with bundler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bundle {
    pub directory: PathBuf,
    #[serde(default)]
    pub deployment: bool,
}

fn parse_mode(mode: Option<&str>) -> Result<Option<u32>> {
    let Some(mode) = mode else { return Ok(None) };
    u32::from_str_radix(mode.trim_start_matches("0o"), 8)
        .map(Some)
        .map_err(|e| Error::InvalidResource(format!("bad mode {:?}: {}", mode, e)))
}

/// Resource kind, in the vocabulary used for logs and errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    SourceList,
    Package,
    Directory,
    Template,
    PackageArchive,
    Tarball,
    User,
    Symlink,
    Service,
    Database,
    DatabaseUser,
    Bundle,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SourceList => "source list",
            Self::Package => "package",
            Self::Directory => "directory",
            Self::Template => "template",
            Self::PackageArchive => "package archive",
            Self::Tarball => "tarball",
            Self::User => "user",
            Self::Symlink => "symlink",
            Self::Service => "service",
            Self::Database => "database",
            Self::DatabaseUser => "database user",
            Self::Bundle => "bundle",
        };
        f.write_str(s)
    }
}

/// Borrowed view of one resource of any kind, handed to the host driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resource<'a> {
    SourceList(&'a SourceList),
    Package(&'a Package),
    Directory(&'a Directory),
    Template(&'a Template),
    PackageArchive(&'a PackageArchive),
    Tarball(&'a Tarball),
    User(&'a User),
    Symlink(&'a Symlink),
    Service(&'a Service),
    Database(&'a Database),
    DatabaseUser(&'a DatabaseUser),
    Bundle(&'a Bundle),
}

impl Resource<'_> {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::SourceList(_) => ResourceKind::SourceList,
            Self::Package(_) => ResourceKind::Package,
            Self::Directory(_) => ResourceKind::Directory,
            Self::Template(_) => ResourceKind::Template,
            Self::PackageArchive(_) => ResourceKind::PackageArchive,
            Self::Tarball(_) => ResourceKind::Tarball,
            Self::User(_) => ResourceKind::User,
            Self::Symlink(_) => ResourceKind::Symlink,
            Self::Service(_) => ResourceKind::Service,
            Self::Database(_) => ResourceKind::Database,
            Self::DatabaseUser(_) => ResourceKind::DatabaseUser,
            Self::Bundle(_) => ResourceKind::Bundle,
        }
    }

    /// Human-readable identity used in logs.
    pub fn name(&self) -> String {
        match self {
            Self::SourceList(s) => s.name.clone(),
            Self::Package(p) => p.qualified_name(),
            Self::Directory(d) => d.path.display().to_string(),
            Self::Template(t) => t.destination.display().to_string(),
            Self::PackageArchive(a) => a.name.clone(),
            Self::Tarball(t) => t.destination.display().to_string(),
            Self::User(u) => u.name.clone(),
            Self::Symlink(s) => s.link.display().to_string(),
            Self::Service(s) => s.name.clone(),
            Self::Database(d) => d.name.clone(),
            Self::DatabaseUser(u) => u.name.clone(),
            Self::Bundle(b) => b.directory.display().to_string(),
        }
    }
}

impl std::fmt::Display for Resource<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind(), self.name())
    }
}

//! Manifest — the desired state of a host, one ordered sequence per resource kind.

use crate::error::{Error, Result};
use crate::resource::*;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Manifest {
    pub source_lists: Vec<SourceList>,
    #[serde(rename = "apt_packages")]
    pub packages: Vec<Package>,
    pub directories: Vec<Directory>,
    pub templates: Vec<Template>,
    #[serde(rename = "personal_package_archives")]
    pub package_archives: Vec<PackageArchive>,
    pub tarballs: Vec<Tarball>,
    pub users: Vec<User>,
    pub symlinks: Vec<Symlink>,
    pub services: Vec<Service>,
    #[serde(rename = "postgres_databases")]
    pub databases: Vec<Database>,
    #[serde(rename = "postgres_database_users")]
    pub database_users: Vec<DatabaseUser>,
    #[serde(rename = "ruby_bundles")]
    pub bundles: Vec<Bundle>,
}

impl Manifest {
    /// Load a manifest from JSON (or YAML for `.yaml`/`.yml`), resolving
    /// template sources relative to the manifest's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::invalid_manifest(path, e.to_string()))?;
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let mut manifest: Manifest = if is_yaml {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::invalid_manifest(path, e.to_string()))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::invalid_manifest(path, e.to_string()))?
        };
        manifest.fix_paths(path);
        tracing::debug!(path = %path.display(), resources = manifest.len(), "loaded manifest");
        Ok(manifest)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    /// Resolve relative template sources against the manifest file's directory.
    pub fn fix_paths(&mut self, manifest_path: &Path) {
        let base = manifest_path.parent().unwrap_or_else(|| Path::new(""));
        for template in &mut self.templates {
            template.source = base.join(&template.source);
        }
    }

    /// Append every sequence of `other` onto this manifest's, keeping order.
    /// Duplicates are kept.
    pub fn merge(&mut self, other: Manifest) {
        self.source_lists.extend(other.source_lists);
        self.packages.extend(other.packages);
        self.directories.extend(other.directories);
        self.templates.extend(other.templates);
        self.package_archives.extend(other.package_archives);
        self.tarballs.extend(other.tarballs);
        self.users.extend(other.users);
        self.symlinks.extend(other.symlinks);
        self.services.extend(other.services);
        self.databases.extend(other.databases);
        self.database_users.extend(other.database_users);
        self.bundles.extend(other.bundles);
    }

    pub fn merged(mut self, other: Manifest) -> Self {
        self.merge(other);
        self
    }

    /// Total number of declared resources.
    pub fn len(&self) -> usize {
        self.source_lists.len()
            + self.packages.len()
            + self.directories.len()
            + self.templates.len()
            + self.package_archives.len()
            + self.tarballs.len()
            + self.users.len()
            + self.symlinks.len()
            + self.services.len()
            + self.databases.len()
            + self.database_users.len()
            + self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FromIterator<Manifest> for Manifest {
    fn from_iter<I: IntoIterator<Item = Manifest>>(iter: I) -> Self {
        iter.into_iter().fold(Manifest::default(), Manifest::merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_default_to_empty() {
        let m = Manifest::from_json(r#"{"apt_packages": [{"name": "nginx"}]}"#).unwrap();
        assert_eq!(m.packages.len(), 1);
        assert!(m.services.is_empty());
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn fix_paths_resolves_relative_sources_only() {
        let mut m = Manifest {
            templates: vec![
                Template {
                    source: "templates/nginx.conf".into(),
                    destination: "/etc/nginx/nginx.conf".into(),
                    variables: Default::default(),
                    mode: None,
                },
                Template {
                    source: "/opt/shared/motd".into(),
                    destination: "/etc/motd".into(),
                    variables: Default::default(),
                    mode: None,
                },
            ],
            ..Default::default()
        };
        m.fix_paths(Path::new("/srv/manifests/web.json"));
        assert_eq!(
            m.templates[0].source,
            Path::new("/srv/manifests/templates/nginx.conf")
        );
        assert_eq!(m.templates[1].source, Path::new("/opt/shared/motd"));
    }

    #[test]
    fn merge_keeps_duplicates_in_order() {
        let mut base = Manifest {
            services: vec![Service { name: "nginx".into() }],
            ..Default::default()
        };
        base.merge(Manifest {
            services: vec![Service { name: "nginx".into() }, Service { name: "redis".into() }],
            ..Default::default()
        });
        let names: Vec<_> = base.services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["nginx", "nginx", "redis"]);
    }
}

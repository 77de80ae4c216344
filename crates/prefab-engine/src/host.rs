//! `SystemHost` — host driver for Debian-family machines.
//!
//! Each resource kind is a small "probe current state, apply if different"
//! routine over apt, systemd, postgres, bundler and the filesystem.

use crate::command::{Args, CommandRunner};
use crate::config::EngineConfig;
use crate::driver::HostDriver;
use crate::fetch::{Fetcher, HttpFetcher};
use prefab_core::*;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info};

pub struct SystemHost {
    runner: CommandRunner,
    sources_dir: PathBuf,
    fetcher: Arc<dyn Fetcher>,
    fetch_timeout: Duration,
}

impl SystemHost {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            runner: CommandRunner::new(config.command_timeout()),
            sources_dir: config.sources_dir.clone(),
            fetcher: Arc::new(HttpFetcher::new()),
            fetch_timeout: config.fetch_timeout(),
        }
    }

    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    // -----------------------------------------------------------------------
    // Probes
    // -----------------------------------------------------------------------

    async fn user_exists(&self, user: &User) -> Result<bool> {
        self.runner.succeeds("id", &["-u", &user.name]).await
    }

    async fn source_list_current(&self, list: &SourceList) -> Result<bool> {
        let path = self.sources_dir.join(list.file_name());
        Ok(read_optional(&path).await?.as_deref() == Some(list.render().as_str()))
    }

    async fn archive_registered(&self, archive: &PackageArchive) -> Result<bool> {
        let needle = format!("/{}/", archive.name);
        let mut entries = match tokio::fs::read_dir(&self.sources_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_list = path
                .extension()
                .is_some_and(|ext| ext == "list" || ext == "sources");
            if is_list && tokio::fs::read_to_string(&path).await?.contains(&needle) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn package_installed(&self, package: &Package) -> Result<bool> {
        let output = self
            .runner
            .run("dpkg-query", &["-W", "-f=${Status} ${Version}", &package.name])
            .await?;
        if !output.success() {
            return Ok(false);
        }
        Ok(dpkg_status_matches(&output.combined, package.version.as_deref()))
    }

    async fn directory_current(&self, dir: &Directory) -> Result<bool> {
        let meta = match tokio::fs::metadata(&dir.path).await {
            Ok(meta) if meta.is_dir() => meta,
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        match dir.mode_bits()? {
            Some(mode) => Ok(permission_bits(&meta) == Some(mode)),
            None => Ok(true),
        }
    }

    async fn template_current(&self, template: &Template) -> Result<bool> {
        let rendered = render_template(template).await?;
        if read_optional(&template.destination).await?.as_deref() != Some(rendered.as_str()) {
            return Ok(false);
        }
        match template.mode_bits()? {
            Some(mode) => {
                let meta = tokio::fs::metadata(&template.destination).await?;
                Ok(permission_bits(&meta) == Some(mode))
            }
            None => Ok(true),
        }
    }

    async fn symlink_current(&self, link: &Symlink) -> Result<bool> {
        match tokio::fs::read_link(&link.link).await {
            Ok(target) => Ok(target == link.target),
            Err(_) => Ok(false),
        }
    }

    async fn database_exists(&self, db: &Database) -> Result<bool> {
        let query = format!(
            "SELECT 1 FROM pg_database WHERE datname = '{}'",
            sql_literal(&db.name)
        );
        self.psql_probe(&query).await
    }

    async fn database_user_exists(&self, user: &DatabaseUser) -> Result<bool> {
        let query = format!(
            "SELECT 1 FROM pg_roles WHERE rolname = '{}'",
            sql_literal(&user.name)
        );
        self.psql_probe(&query).await
    }

    async fn psql_probe(&self, query: &str) -> Result<bool> {
        let output = self
            .runner
            .run_checked("sudo", &["-u", "postgres", "psql", "-tAc", query])
            .await?;
        Ok(output.trim() == "1")
    }

    // -----------------------------------------------------------------------
    // Appliers
    // -----------------------------------------------------------------------

    async fn create_user(&self, user: &User) -> Result<()> {
        let mut args = Args::new();
        args.push("--create-home");
        if let Some(home) = &user.home {
            args.push("--home-dir").push_path(home);
        }
        if let Some(shell) = &user.shell {
            args.push("--shell").push(shell.as_str());
        }
        if user.system {
            args.push("--system");
        }
        args.push(user.name.as_str());
        self.runner.run_checked("useradd", &args.as_strs()).await?;
        Ok(())
    }

    async fn write_source_list(&self, list: &SourceList) -> Result<()> {
        tokio::fs::create_dir_all(&self.sources_dir).await?;
        let path = self.sources_dir.join(list.file_name());
        tokio::fs::write(&path, list.render()).await?;
        info!("wrote {}", path.display());
        Ok(())
    }

    async fn add_archive(&self, archive: &PackageArchive) -> Result<()> {
        self.runner
            .run_checked("add-apt-repository", &["-y", &archive.repository()])
            .await?;
        Ok(())
    }

    async fn install_package(&self, package: &Package) -> Result<()> {
        self.runner
            .run_checked("apt-get", &["install", "-y", "-q", &package.qualified_name()])
            .await?;
        Ok(())
    }

    /// Download, extract into a scratch dir beside the destination, then
    /// rename into place. The destination only appears on success.
    async fn unpack_tarball(&self, tarball: &Tarball) -> Result<()> {
        let url = url::Url::parse(&tarball.url)
            .map_err(|e| Error::invalid_locator(&tarball.url, e.to_string()))?;
        let download = tempfile::tempdir()?;
        let archive = download.path().join("download.tar.gz");
        tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(&url, &archive))
            .await
            .map_err(|_| {
                Error::FetchFailed(format!("{}: timed out after {:?}", url, self.fetch_timeout))
            })??;

        let parent = match tarball.destination.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        tokio::fs::create_dir_all(parent).await?;
        let staging = tempfile::Builder::new()
            .prefix(".prefab-unpack-")
            .tempdir_in(parent)?;
        let mut args = Args::new();
        args.push("-xzf")
            .push_path(&archive)
            .push("-C")
            .push_path(staging.path());
        self.runner.run_checked("tar", &args.as_strs()).await?;

        tokio::fs::rename(staging.path(), &tarball.destination).await?;
        info!("unpacked {} into {}", url, tarball.destination.display());
        Ok(())
    }

    async fn create_directory(&self, dir: &Directory) -> Result<()> {
        tokio::fs::create_dir_all(&dir.path).await?;
        if let Some(mode) = dir.mode_bits()? {
            set_mode(&dir.path, mode).await?;
        }
        Ok(())
    }

    async fn write_template(&self, template: &Template) -> Result<()> {
        let rendered = render_template(template).await?;
        if let Some(parent) = template.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&template.destination, rendered).await?;
        if let Some(mode) = template.mode_bits()? {
            set_mode(&template.destination, mode).await?;
        }
        Ok(())
    }

    async fn create_symlink(&self, link: &Symlink) -> Result<()> {
        if tokio::fs::symlink_metadata(&link.link).await.is_ok() {
            debug!("replacing {}", link.link.display());
            tokio::fs::remove_file(&link.link).await?;
        }
        if let Some(parent) = link.link.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        symlink(&link.target, &link.link).await
    }

    async fn create_database(&self, db: &Database) -> Result<()> {
        let mut args = Args::new();
        args.push("-u").push("postgres").push("createdb");
        if let Some(owner) = &db.owner {
            args.push("--owner").push(owner.as_str());
        }
        args.push(db.name.as_str());
        self.runner.run_checked("sudo", &args.as_strs()).await?;
        Ok(())
    }

    async fn create_database_user(&self, user: &DatabaseUser) -> Result<()> {
        let mut args = Args::new();
        args.push("-u").push("postgres").push("createuser");
        if user.superuser {
            args.push("--superuser");
        }
        args.push(user.name.as_str());
        self.runner.run_checked("sudo", &args.as_strs()).await?;
        Ok(())
    }

    async fn install_bundle(&self, bundle: &Bundle) -> Result<()> {
        let mut args = vec!["install"];
        if bundle.deployment {
            args.push("--deployment");
        }
        self.runner
            .run_checked_in(Some(bundle.directory.as_path()), "bundle", &args)
            .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl HostDriver for SystemHost {
    async fn is_satisfied(&self, resource: Resource<'_>) -> Result<bool> {
        match resource {
            Resource::User(u) => self.user_exists(u).await,
            Resource::SourceList(s) => self.source_list_current(s).await,
            Resource::PackageArchive(a) => self.archive_registered(a).await,
            Resource::Package(p) => self.package_installed(p).await,
            Resource::Tarball(t) => Ok(tokio::fs::try_exists(&t.destination).await?),
            Resource::Directory(d) => self.directory_current(d).await,
            Resource::Template(t) => self.template_current(t).await,
            Resource::Symlink(s) => self.symlink_current(s).await,
            Resource::Database(d) => self.database_exists(d).await,
            Resource::DatabaseUser(u) => self.database_user_exists(u).await,
            Resource::Bundle(b) => {
                self.runner
                    .run_in(Some(b.directory.as_path()), "bundle", &["check"])
                    .await
                    .map(|o| o.success())
            }
            Resource::Service(s) => {
                self.runner
                    .succeeds("systemctl", &["is-active", "--quiet", &s.name])
                    .await
            }
        }
    }

    async fn apply(&self, resource: Resource<'_>) -> Result<()> {
        match resource {
            Resource::User(u) => self.create_user(u).await,
            Resource::SourceList(s) => self.write_source_list(s).await,
            Resource::PackageArchive(a) => self.add_archive(a).await,
            Resource::Package(p) => self.install_package(p).await,
            Resource::Tarball(t) => self.unpack_tarball(t).await,
            Resource::Directory(d) => self.create_directory(d).await,
            Resource::Template(t) => self.write_template(t).await,
            Resource::Symlink(s) => self.create_symlink(s).await,
            Resource::Database(d) => self.create_database(d).await,
            Resource::DatabaseUser(u) => self.create_database_user(u).await,
            Resource::Bundle(b) => self.install_bundle(b).await,
            Resource::Service(s) => {
                self.runner
                    .run_checked("systemctl", &["enable", "--now", &s.name])
                    .await?;
                Ok(())
            }
        }
    }

    async fn archive_locators(&self, package: &Package) -> Result<Vec<String>> {
        let output = self
            .runner
            .run_checked(
                "apt-get",
                &["install", "-y", "-qq", "--print-uris", &package.qualified_name()],
            )
            .await?;
        Ok(parse_print_uris(&output))
    }

    async fn refresh_index(&self) -> Result<()> {
        info!("Run `apt-get update`");
        self.runner.run_checked("apt-get", &["update"]).await?;
        Ok(())
    }
}

/// Extract URLs from `apt-get --print-uris` lines: `'URL' FILE SIZE HASH`.
pub(crate) fn parse_print_uris(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let rest = line.trim().strip_prefix('\'')?;
            let end = rest.find('\'')?;
            Some(rest[..end].to_string())
        })
        .collect()
}

pub(crate) fn dpkg_status_matches(output: &str, version: Option<&str>) -> bool {
    let Some(installed) = output.trim().strip_prefix("install ok installed") else {
        return false;
    };
    match version {
        Some(wanted) => installed.trim() == wanted,
        None => true,
    }
}

/// Replace `{{ key }}` placeholders. Unknown keys are left as-is.
pub(crate) fn render(source: &str, variables: &std::collections::BTreeMap<String, String>) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").expect("placeholder pattern")
    });
    re.replace_all(source, |caps: &regex::Captures<'_>| {
        variables
            .get(&caps[1])
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    })
    .into_owned()
}

async fn render_template(template: &Template) -> Result<String> {
    let source = tokio::fs::read_to_string(&template.source).await.map_err(|e| {
        Error::InvalidResource(format!("template source {}: {}", template.source.display(), e))
    })?;
    Ok(render(&source, &template.variables))
}

fn sql_literal(value: &str) -> String {
    value.replace('\'', "''")
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn permission_bits(meta: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(meta.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn permission_bits(_meta: &std::fs::Metadata) -> Option<u32> {
    None
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
async fn symlink(target: &Path, link: &Path) -> Result<()> {
    tokio::fs::symlink(target, link).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn symlink(_target: &Path, link: &Path) -> Result<()> {
    Err(Error::InvalidResource(format!(
        "symlinks are unsupported on this platform: {}",
        link.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn host(sources_dir: &Path) -> SystemHost {
        let config = EngineConfig {
            sources_dir: sources_dir.to_path_buf(),
            ..Default::default()
        };
        SystemHost::new(&config)
    }

    #[test]
    fn print_uris_extracts_quoted_urls() {
        let out = "'http://archive.ubuntu.com/ubuntu/pool/main/n/nginx/nginx-common_1.18.0_all.deb' nginx-common_1.18.0_all.deb 37512 SHA256:ab\n\
                   'http://archive.ubuntu.com/ubuntu/pool/main/n/nginx/nginx_1.18.0_amd64.deb' nginx_1.18.0_amd64.deb 3620 SHA256:cd\n";
        let urls = parse_print_uris(out);
        assert_eq!(urls.len(), 2);
        assert!(urls[1].ends_with("nginx_1.18.0_amd64.deb"));
        assert!(parse_print_uris("Reading package lists...\n").is_empty());
    }

    #[test]
    fn dpkg_status_checks_version_when_pinned() {
        assert!(dpkg_status_matches("install ok installed 1.18.0", None));
        assert!(dpkg_status_matches("install ok installed 1.18.0", Some("1.18.0")));
        assert!(!dpkg_status_matches("install ok installed 1.18.0", Some("1.20.1")));
        assert!(!dpkg_status_matches("deinstall ok config-files 1.18.0", None));
    }

    #[test]
    fn render_substitutes_known_keys() {
        let mut vars = BTreeMap::new();
        vars.insert("port".to_string(), "8080".to_string());
        assert_eq!(
            render("listen {{ port }}; root {{root}};", &vars),
            "listen 8080; root {{root}};"
        );
    }

    #[test]
    fn sql_literal_escapes_quotes() {
        assert_eq!(sql_literal("o'brien"), "o''brien");
    }

    #[tokio::test]
    async fn source_list_written_once() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path());
        let list = SourceList {
            name: "pgdg".into(),
            entries: vec!["deb http://apt.postgresql.org/pub/repos/apt focal-pgdg main".into()],
        };
        assert!(!host.is_satisfied(Resource::SourceList(&list)).await.unwrap());
        host.apply(Resource::SourceList(&list)).await.unwrap();
        assert!(host.is_satisfied(Resource::SourceList(&list)).await.unwrap());
    }

    #[tokio::test]
    async fn archive_detected_from_list_files() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path());
        let archive = PackageArchive { name: "nginx/stable".into() };
        assert!(!host.is_satisfied(Resource::PackageArchive(&archive)).await.unwrap());

        std::fs::write(
            tmp.path().join("nginx-ubuntu-stable-focal.list"),
            "deb http://ppa.launchpad.net/nginx/stable/ubuntu focal main\n",
        )
        .unwrap();
        assert!(host.is_satisfied(Resource::PackageArchive(&archive)).await.unwrap());
    }

    #[tokio::test]
    async fn directory_and_template_converge() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path());
        let dir = Directory {
            path: tmp.path().join("srv/www"),
            mode: Some("0750".into()),
        };
        assert!(!host.is_satisfied(Resource::Directory(&dir)).await.unwrap());
        host.apply(Resource::Directory(&dir)).await.unwrap();
        assert!(host.is_satisfied(Resource::Directory(&dir)).await.unwrap());

        let source = tmp.path().join("index.html.tmpl");
        std::fs::write(&source, "<h1>{{ title }}</h1>").unwrap();
        let mut variables = BTreeMap::new();
        variables.insert("title".to_string(), "hello".to_string());
        let template = Template {
            source,
            destination: dir.path.join("index.html"),
            variables,
            mode: None,
        };
        assert!(!host.is_satisfied(Resource::Template(&template)).await.unwrap());
        host.apply(Resource::Template(&template)).await.unwrap();
        assert!(host.is_satisfied(Resource::Template(&template)).await.unwrap());
        assert_eq!(
            std::fs::read_to_string(&template.destination).unwrap(),
            "<h1>hello</h1>"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_repointed() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path());
        let old = tmp.path().join("releases/1");
        let new = tmp.path().join("releases/2");
        std::fs::create_dir_all(&old).unwrap();
        std::fs::create_dir_all(&new).unwrap();
        let link_path = tmp.path().join("current");
        std::os::unix::fs::symlink(&old, &link_path).unwrap();

        let link = Symlink {
            target: new.clone(),
            link: link_path.clone(),
        };
        assert!(!host.is_satisfied(Resource::Symlink(&link)).await.unwrap());
        host.apply(Resource::Symlink(&link)).await.unwrap();
        assert_eq!(std::fs::read_link(&link_path).unwrap(), new);
        assert!(host.is_satisfied(Resource::Symlink(&link)).await.unwrap());
    }

    #[tokio::test]
    async fn missing_template_source_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path());
        let template = Template {
            source: tmp.path().join("missing.tmpl"),
            destination: tmp.path().join("out"),
            variables: BTreeMap::new(),
            mode: None,
        };
        assert!(matches!(
            host.is_satisfied(Resource::Template(&template)).await,
            Err(Error::InvalidResource(_))
        ));
    }

    struct GarbageFetcher;

    #[async_trait::async_trait]
    impl Fetcher for GarbageFetcher {
        async fn fetch(&self, _url: &url::Url, destination: &Path) -> Result<()> {
            tokio::fs::write(destination, b"not a tarball").await?;
            Ok(())
        }
    }

    struct StalledFetcher;

    #[async_trait::async_trait]
    impl Fetcher for StalledFetcher {
        async fn fetch(&self, _url: &url::Url, _destination: &Path) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn tarball(root: &Path) -> Tarball {
        Tarball {
            url: "http://releases.example/app-1.0.tar.gz".into(),
            destination: root.join("opt/app"),
        }
    }

    #[tokio::test]
    async fn failed_unpack_is_retried_next_run() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path()).with_fetcher(Arc::new(GarbageFetcher));
        let tarball = tarball(tmp.path());

        assert!(host.apply(Resource::Tarball(&tarball)).await.is_err());
        assert!(!host.is_satisfied(Resource::Tarball(&tarball)).await.unwrap());
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path().join("opt"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert!(leftovers.is_empty(), "{:?}", leftovers);
    }

    #[tokio::test]
    async fn stalled_tarball_download_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            sources_dir: tmp.path().to_path_buf(),
            fetch_timeout_secs: 1,
            ..Default::default()
        };
        let host = SystemHost::new(&config).with_fetcher(Arc::new(StalledFetcher));
        let tarball = tarball(tmp.path());

        let started = std::time::Instant::now();
        let err = host.apply(Resource::Tarball(&tarball)).await.unwrap_err();
        assert!(matches!(err, Error::FetchFailed(_)), "{err}");
        assert!(started.elapsed() < Duration::from_secs(30));
        assert!(!tarball.destination.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn template_mode_change_is_reapplied() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let host = host(tmp.path());
        let source = tmp.path().join("motd.tmpl");
        std::fs::write(&source, "welcome").unwrap();
        let mut template = Template {
            source,
            destination: tmp.path().join("motd"),
            variables: BTreeMap::new(),
            mode: Some("0644".into()),
        };
        host.apply(Resource::Template(&template)).await.unwrap();
        assert!(host.is_satisfied(Resource::Template(&template)).await.unwrap());

        template.mode = Some("0600".into());
        assert!(!host.is_satisfied(Resource::Template(&template)).await.unwrap());
        host.apply(Resource::Template(&template)).await.unwrap();
        let mode = std::fs::metadata(&template.destination).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(host.is_satisfied(Resource::Template(&template)).await.unwrap());
    }
}

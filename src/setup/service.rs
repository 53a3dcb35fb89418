//! Provisioning orchestrator

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::copy::{BackendCopyContribution, CopyContribution, RemoteCopyService};
use super::exec::{command_line, quote, retry};
use super::platform::RemotePlatform;
use super::runtime::RuntimeInstaller;
use super::{SetupError, StatusReport};
use crate::config::{ApplicationOptions, CopyStrategy, RemoteConfig, SetupOptions};
use crate::native::{builtin_contributions, Downloader, NativeDependencyService};
use crate::ssh::{ExecResult, RemoteTransport};

/// Startup line printed by the remote backend once it accepts connections
static LISTENING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"listening on http://localhost:(\d+)").expect("valid regex")
});

/// What one provisioning run found and did. Never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningState {
    pub platform: RemotePlatform,
    pub home: String,
    pub app_dir: String,
    pub runtime_dir: String,
    /// Runtime was already installed before this run
    pub runtime_present: bool,
    /// Payload was already installed before this run
    pub payload_present: bool,
    /// Port the remote backend listens on
    pub port: u16,
}

pub struct RemoteSetupService {
    copy: Arc<RemoteCopyService>,
    runtime: RuntimeInstaller,
    application: ApplicationOptions,
    options: SetupOptions,
}

impl RemoteSetupService {
    pub fn new(
        copy: Arc<RemoteCopyService>,
        runtime: RuntimeInstaller,
        application: ApplicationOptions,
        options: SetupOptions,
    ) -> Self {
        Self {
            copy,
            runtime,
            application,
            options,
        }
    }

    /// Wire the built-in native dependencies and backend payload
    pub fn from_config(config: &RemoteConfig, downloader: Arc<dyn Downloader>) -> Self {
        let mut native = NativeDependencyService::new(downloader.clone(), config.native.clone());
        for contribution in builtin_contributions() {
            native.register(contribution);
        }
        let contributions: Vec<Arc<dyn CopyContribution>> = vec![Arc::new(BackendCopyContribution)];
        let copy = RemoteCopyService::new(
            &config.application.project_path,
            contributions,
            Arc::new(native),
        );
        Self::new(
            Arc::new(copy),
            RuntimeInstaller::new(config.runtime.clone(), downloader),
            config.application.clone(),
            config.setup.clone(),
        )
    }

    /// Provision the remote host and launch the backend
    pub async fn setup(
        &self,
        transport: &dyn RemoteTransport,
        report: &StatusReport,
    ) -> Result<ProvisioningState, SetupError> {
        report("Identifying remote system...");
        // Step 1: platform
        let platform = self.detect_platform(transport).await?;
        info!("[remote-setup] Remote platform: {}", platform);

        // Step 2: application directory under the remote home
        let home = self.resolve_home(transport, platform).await?;
        let app_dir = platform.join_path(&[home.clone(), format!(".{}", self.app_name())]);
        self.mkdir(transport, platform, &app_dir).await?;

        // Step 3: runtime
        let runtime_name = self.runtime.directory_name(platform);
        let runtime_dir = platform.join_path(&[app_dir.as_str(), runtime_name.as_str()]);
        let runtime_present = self
            .ensure_runtime_installed(transport, platform, &app_dir, &runtime_dir, report)
            .await?;

        // Step 4: payload
        let payload_present = self
            .ensure_payload_installed(transport, platform, &app_dir, report)
            .await?;

        // Step 5: launch
        report("Starting application on remote...");
        let port = self
            .start_application(transport, platform, &app_dir, &runtime_dir)
            .await?;
        info!("[remote-setup] Remote backend listening on port {}", port);

        Ok(ProvisioningState {
            platform,
            home,
            app_dir,
            runtime_dir,
            runtime_present,
            payload_present,
            port,
        })
    }

    /// `<name>-<version>-remote`, stripped of characters unsafe in paths
    pub fn app_name(&self) -> String {
        let raw = format!("{}-{}", self.application.name, self.application.version);
        let cleaned: String = raw
            .chars()
            .filter(|c| !matches!(c, '@' | '<' | '>' | ':' | '"' | '\\' | '|' | '?' | '*'))
            .map(|c| if c == '/' { '-' } else { c })
            .collect();
        format!("{}-remote", cleaned)
    }

    async fn exec_retried(
        &self,
        transport: &dyn RemoteTransport,
        command: &str,
    ) -> Result<ExecResult, SetupError> {
        Ok(retry(move || transport.exec(command), self.options.exec_retry_limit).await?)
    }

    pub async fn detect_platform(
        &self,
        transport: &dyn RemoteTransport,
    ) -> Result<RemotePlatform, SetupError> {
        let result = self.exec_retried(transport, "uname -s").await?;
        RemotePlatform::classify(&result).ok_or(SetupError::PlatformDetection {
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    pub async fn resolve_home(
        &self,
        transport: &dyn RemoteTransport,
        platform: RemotePlatform,
    ) -> Result<String, SetupError> {
        let home = match platform {
            RemotePlatform::Windows => {
                let powershell = self.exec_retried(transport, "echo $HOME").await?;
                if powershell.stdout.trim() == "$HOME" {
                    // not PowerShell; cmd leaves the variable unexpanded
                    self.exec_retried(transport, "echo %userprofile%")
                        .await?
                        .stdout
                } else {
                    powershell.stdout
                }
            }
            _ => self.exec_retried(transport, "eval echo ~").await?.stdout,
        };
        let home = home.trim().to_string();
        if home.is_empty() {
            return Err(SetupError::HomeDirectory);
        }
        debug!("[remote-setup] Remote home: {}", home);
        Ok(home)
    }

    pub async fn mkdir(
        &self,
        transport: &dyn RemoteTransport,
        platform: RemotePlatform,
        path: &str,
    ) -> Result<(), SetupError> {
        let recursive = if platform == RemotePlatform::Windows { "" } else { " -p" };
        let command = format!("mkdir{} {};echo \"Success\"", recursive, quote(platform, path));
        let result = self.exec_retried(transport, &command).await?;
        if !result.stderr.is_empty() {
            return Err(SetupError::CreateDirectory(result.stderr));
        }
        Ok(())
    }

    pub async fn dir_exists(
        &self,
        transport: &dyn RemoteTransport,
        platform: RemotePlatform,
        path: &str,
    ) -> Result<bool, SetupError> {
        let command = format!("cd {};echo \"Success\"", quote(platform, path));
        let result = self.exec_retried(transport, &command).await?;
        Ok(result.stderr.is_empty())
    }

    pub async fn unzip(
        &self,
        transport: &dyn RemoteTransport,
        platform: RemotePlatform,
        file: &str,
        directory: &str,
    ) -> Result<(), SetupError> {
        let command = command_line(platform, "tar -xf", &[file, "-C", directory]);
        let result = transport.exec(&command).await?;
        if !result.stderr.is_empty() {
            return Err(SetupError::Unzip(result.stderr));
        }
        Ok(())
    }

    /// Returns whether the runtime was already there
    pub async fn ensure_runtime_installed(
        &self,
        transport: &dyn RemoteTransport,
        platform: RemotePlatform,
        app_dir: &str,
        runtime_dir: &str,
        report: &StatusReport,
    ) -> Result<bool, SetupError> {
        if self.dir_exists(transport, platform, runtime_dir).await? {
            debug!("[remote-setup] Runtime present at {}", runtime_dir);
            return Ok(true);
        }

        report("Downloading and installing Node.js on remote...");
        if let Some(script) = self.runtime.install_script(platform, app_dir) {
            let result = transport
                .exec(&command_line(platform, "sh -c", &[script]))
                .await?;
            if result.stderr.is_empty() {
                info!("[remote-setup] Runtime installed by remote script");
                return Ok(false);
            }
            warn!(
                "[remote-setup] Install script failed, copying runtime instead: {}",
                result.stderr.trim()
            );
        }

        let archive = self.runtime.download(platform).await?;
        let remote_archive =
            platform.join_path(&[app_dir.to_string(), self.runtime.archive_name(platform)]);
        transport.copy(&archive, &remote_archive).await?;
        self.unzip(transport, platform, &remote_archive, app_dir)
            .await?;
        Ok(false)
    }

    /// Returns whether the payload was already there
    pub async fn ensure_payload_installed(
        &self,
        transport: &dyn RemoteTransport,
        platform: RemotePlatform,
        app_dir: &str,
        report: &StatusReport,
    ) -> Result<bool, SetupError> {
        let lib_dir = platform.join_path(&[app_dir, "lib"]);
        if self.dir_exists(transport, platform, &lib_dir).await? {
            debug!("[remote-setup] Payload present at {}", lib_dir);
            return Ok(true);
        }

        report("Copying application to remote...");
        match self.options.copy_strategy {
            CopyStrategy::Archive => {
                let archive =
                    platform.join_path(&[app_dir.to_string(), format!("{}.tar", self.app_name())]);
                self.copy.copy_archive(transport, platform, &archive).await?;
                self.unzip(transport, platform, &archive, app_dir).await?;
            }
            CopyStrategy::Files => {
                self.copy.copy_files(transport, platform, app_dir).await?;
            }
        }
        Ok(false)
    }

    /// Launch the backend and wait for its startup line
    pub async fn start_application(
        &self,
        transport: &dyn RemoteTransport,
        platform: RemotePlatform,
        app_dir: &str,
        runtime_dir: &str,
    ) -> Result<u16, SetupError> {
        let node = platform.join_path(&[runtime_dir, "bin", platform.node_executable()]);
        let mut entry = vec![app_dir];
        entry.extend(self.application.entry_point.split('/'));
        let main = platform.join_path(&entry);

        let command = format!(
            "cd {};{}",
            quote(platform, app_dir),
            command_line(
                platform,
                &quote(platform, &node),
                &[main.as_str(), "--port=0", "--remote"]
            )
        );
        let result = transport
            .exec_partial(&command, &|stdout: &str| LISTENING.is_match(stdout))
            .await?;

        LISTENING
            .captures(&result.stdout)
            .and_then(|caps| caps[1].parse::<u16>().ok())
            .ok_or(SetupError::Launch(result.stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NativeOptions, RuntimeOptions};
    use crate::native::HttpDownloader;
    use crate::setup::runtime::tests::CountingDownloader;
    use crate::testing::MockTransport;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    const APP_DIR: &str = "/home/u/.theia-1.0.0-remote";

    struct Fixture {
        service: RemoteSetupService,
        downloader: Arc<CountingDownloader>,
        _project: TempDir,
        _cache: TempDir,
    }

    fn fixture(strategy: CopyStrategy) -> Fixture {
        let project = TempDir::new().unwrap();
        std::fs::write(project.path().join("package.json"), b"{}").unwrap();
        std::fs::create_dir_all(project.path().join("lib/backend")).unwrap();
        std::fs::write(project.path().join("lib/backend/main.js"), b"main").unwrap();

        let cache = TempDir::new().unwrap();
        let downloader = Arc::new(CountingDownloader::default());
        let native = NativeDependencyService::new(
            Arc::new(HttpDownloader::new().unwrap()),
            NativeOptions::default(),
        );
        let contributions: Vec<Arc<dyn CopyContribution>> =
            vec![Arc::new(BackendCopyContribution)];
        let copy = RemoteCopyService::new(project.path(), contributions, Arc::new(native));
        let runtime = RuntimeInstaller::with_cache_dir(
            RuntimeOptions::default(),
            downloader.clone(),
            cache.path().to_path_buf(),
        );
        let application = ApplicationOptions {
            name: "theia".into(),
            version: "1.0.0".into(),
            ..Default::default()
        };
        let options = SetupOptions {
            copy_strategy: strategy,
            ..Default::default()
        };
        Fixture {
            service: RemoteSetupService::new(Arc::new(copy), runtime, application, options),
            downloader,
            _project: project,
            _cache: cache,
        }
    }

    /// A Linux host with runtime and payload already installed
    fn linux_host() -> MockTransport {
        let transport = MockTransport::new();
        transport
            .on("uname -s", "Linux\n", "")
            .on("eval echo ~", "/home/u\n", "")
            .on("mkdir", "Success\n", "");
        transport
    }

    fn runtime_present(transport: &MockTransport) {
        transport.on("/node-v18.12.1-linux-x64;echo", "Success\n", "");
    }

    fn payload_present(transport: &MockTransport) {
        transport.on("/lib;echo", "Success\n", "");
    }

    fn launches(transport: &MockTransport) {
        transport.on(
            "--port=0",
            "Configuration directory URI: ...\nlistening on http://localhost:54321\n",
            "",
        );
    }

    fn no_report() -> impl Fn(&str) + Send + Sync {
        |_: &str| {}
    }

    #[tokio::test]
    async fn test_detect_platform() {
        let f = fixture(CopyStrategy::Archive);
        let darwin = MockTransport::new();
        darwin.on("uname -s", "Darwin\n", "");
        assert_eq!(
            f.service.detect_platform(&darwin).await.unwrap(),
            RemotePlatform::Darwin
        );

        let linux = MockTransport::new();
        linux.on("uname -s", "Linux\n", "");
        assert_eq!(
            f.service.detect_platform(&linux).await.unwrap(),
            RemotePlatform::Linux
        );
    }

    #[tokio::test]
    async fn test_detect_platform_empty_output_is_fatal() {
        let f = fixture(CopyStrategy::Archive);
        let silent = MockTransport::new();
        let err = f.service.detect_platform(&silent).await.unwrap_err();
        assert!(matches!(
            &err,
            SetupError::PlatformDetection { stdout, stderr } if stdout.is_empty() && stderr.is_empty()
        ));
        assert_eq!(silent.count("uname -s"), 20);
    }

    #[tokio::test]
    async fn test_windows_home_falls_back_to_userprofile() {
        let f = fixture(CopyStrategy::Archive);
        let transport = MockTransport::new();
        transport
            .on("echo $HOME", "$HOME\r\n", "")
            .on("echo %userprofile%", "C:\\Users\\u\r\n", "");
        let home = f
            .service
            .resolve_home(&transport, RemotePlatform::Windows)
            .await
            .unwrap();
        assert_eq!(home, "C:\\Users\\u");
    }

    #[test]
    fn test_app_name_is_cleaned() {
        let mut f = fixture(CopyStrategy::Archive);
        f.service.application.name = "@scope/app".into();
        f.service.application.version = "1.0.0".into();
        assert_eq!(f.service.app_name(), "scope-app-1.0.0-remote");
    }

    #[tokio::test]
    async fn test_provisioned_host_only_launches() {
        let f = fixture(CopyStrategy::Archive);
        let transport = linux_host();
        runtime_present(&transport);
        payload_present(&transport);
        launches(&transport);

        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        let report = move |line: &str| sink.lock().push(line.to_string());
        let state = f.service.setup(&transport, &report).await.unwrap();

        assert_eq!(state.port, 54321);
        assert_eq!(state.app_dir, APP_DIR);
        assert!(state.runtime_present && state.payload_present);
        assert!(transport.copies().is_empty());
        assert!(f.downloader.requested.lock().is_empty());
        assert_eq!(transport.count("sh -c"), 0);
        assert_eq!(
            reports.lock().as_slice(),
            ["Identifying remote system...", "Starting application on remote..."]
        );
        assert!(transport.commands().iter().any(|c| c.starts_with(&format!(
            "cd {};{}/node-v18.12.1-linux-x64/bin/node {}/lib/backend/main.js --port=0 --remote",
            APP_DIR, APP_DIR, APP_DIR
        ))));
    }

    #[tokio::test]
    async fn test_runtime_installed_by_script() {
        let f = fixture(CopyStrategy::Archive);
        let transport = linux_host();
        transport.on("/node-v18.12.1-linux-x64;echo", "", "No such file or directory");
        payload_present(&transport);
        launches(&transport);

        let state = f.service.setup(&transport, &no_report()).await.unwrap();
        assert!(!state.runtime_present);
        assert_eq!(transport.count("sh -c"), 1);
        assert!(transport.copies().is_empty());
        assert!(f.downloader.requested.lock().is_empty());
    }

    #[tokio::test]
    async fn test_runtime_fallback_copies_archive() {
        let f = fixture(CopyStrategy::Archive);
        let transport = linux_host();
        transport
            .on("/node-v18.12.1-linux-x64;echo", "", "No such file or directory")
            .on("sh -c", "", "curl or wget is required");
        payload_present(&transport);
        launches(&transport);

        f.service.setup(&transport, &no_report()).await.unwrap();
        let copies = transport.copies();
        assert_eq!(copies.len(), 1);
        assert_eq!(
            copies[0].remote,
            format!("{}/node-v18.12.1-linux-x64.tar.xz", APP_DIR)
        );
        assert_eq!(copies[0].contents, b"node-archive");
        assert_eq!(
            transport.count(&format!(
                "tar -xf {}/node-v18.12.1-linux-x64.tar.xz -C {}",
                APP_DIR, APP_DIR
            )),
            1
        );
    }

    #[tokio::test]
    async fn test_payload_copied_at_most_once() {
        let f = fixture(CopyStrategy::Archive);
        let transport = linux_host();
        runtime_present(&transport);
        transport
            .on("/lib;echo", "", "No such file or directory")
            .on("/lib;echo", "Success\n", "");
        launches(&transport);

        let first = f.service.setup(&transport, &no_report()).await.unwrap();
        let second = f.service.setup(&transport, &no_report()).await.unwrap();
        assert!(!first.payload_present);
        assert!(second.payload_present);

        let copies = transport.copies();
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].remote, format!("{}/theia-1.0.0-remote.tar", APP_DIR));
        assert_eq!(transport.count("tar -xf"), 1);
    }

    #[tokio::test]
    async fn test_payload_files_strategy_skips_extraction() {
        let f = fixture(CopyStrategy::Files);
        let transport = linux_host();
        runtime_present(&transport);
        transport.on("/lib;echo", "", "No such file or directory");
        launches(&transport);

        f.service.setup(&transport, &no_report()).await.unwrap();
        assert_eq!(transport.copies().len(), 2);
        assert_eq!(transport.count("tar -xf"), 0);
    }

    #[tokio::test]
    async fn test_mkdir_stderr_is_fatal() {
        let f = fixture(CopyStrategy::Archive);
        let transport = MockTransport::new();
        transport
            .on("uname -s", "Linux\n", "")
            .on("eval echo ~", "/home/u\n", "")
            .on("mkdir", "", "Permission denied");
        let err = f.service.setup(&transport, &no_report()).await.unwrap_err();
        assert!(matches!(err, SetupError::CreateDirectory(ref e) if e == "Permission denied"));
    }

    #[tokio::test]
    async fn test_start_application_parses_port() {
        let f = fixture(CopyStrategy::Archive);
        let transport = MockTransport::new();
        transport.on("--port=0", "...listening on http://localhost:54321...", "");
        let port = f
            .service
            .start_application(&transport, RemotePlatform::Linux, APP_DIR, "/rt")
            .await
            .unwrap();
        assert_eq!(port, 54321);
    }

    #[tokio::test]
    async fn test_start_application_without_match_fails() {
        let f = fixture(CopyStrategy::Archive);
        let transport = MockTransport::new();
        transport.on("--port=0", "", "Error: Cannot find module");
        let err = f
            .service
            .start_application(&transport, RemotePlatform::Linux, APP_DIR, "/rt")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Could not start remote system: Error: Cannot find module"
        );
    }
}

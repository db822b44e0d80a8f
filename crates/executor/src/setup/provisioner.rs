use std::path::{Path, PathBuf};

use async_trait::async_trait;
use scaleio_config::PackageUrls;
use scaleio_scheduler::reconcile::ADMIN_USER;
use scaleio_scheduler::state::{ClusterState, Node, Persona};
use tokio::process::Command;
use tracing::{debug, info};

use super::{download, NodeSetup, OsFamily, SetupError, SetupOutcome};

/// Kernel the storage client module is built against.
pub const REQUIRED_KERNEL: &str = "4.2.0-30-generic";

const REXRAY_INSTALL_URL: &str = "https://rexray.io/install";
const REXRAY_INSTALL_CHECK: &str = "rexray has been installed to";
const REXRAY_CONFIG: &str = "/etc/rexray/config.yml";

const DVDCLI_INSTALL_URL: &str = "https://dvdcli.io/install";
const DVDCLI_INSTALL_CHECK: &str = "dvdcli has been installed to";

const ISOLATOR_PATH: &str = "/usr/lib/libmesos_dvdi_isolator.so";
const GATEWAY_PROPERTIES: &str = "/opt/emc/scaleio/gateway/webapps/ROOT/WEB-INF/classes/gatewayUser.properties";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Package {
    Mdm,
    Sds,
    Sdc,
    Lia,
    Gateway,
}

impl Package {
    fn label(self) -> &'static str {
        match self {
            Package::Mdm => "mdm",
            Package::Sds => "sds",
            Package::Sdc => "sdc",
            Package::Lia => "lia",
            Package::Gateway => "gateway",
        }
    }

    fn installed_name(self, family: OsFamily) -> &'static str {
        match (family, self) {
            (OsFamily::Debian, Package::Mdm) => "emc-scaleio-mdm",
            (OsFamily::Debian, Package::Sds) => "emc-scaleio-sds",
            (OsFamily::Debian, Package::Sdc) => "emc-scaleio-sdc",
            (OsFamily::Debian, Package::Lia) => "emc-scaleio-lia",
            (OsFamily::Debian, Package::Gateway) => "emc-scaleio-gateway",
            (OsFamily::Rhel, Package::Mdm) => "EMC-ScaleIO-mdm",
            (OsFamily::Rhel, Package::Sds) => "EMC-ScaleIO-sds",
            (OsFamily::Rhel, Package::Sdc) => "EMC-ScaleIO-sdc",
            (OsFamily::Rhel, Package::Lia) => "EMC-ScaleIO-lia",
            (OsFamily::Rhel, Package::Gateway) => "EMC-ScaleIO-gateway",
        }
    }

    fn url(self, urls: &PackageUrls) -> &str {
        match self {
            Package::Mdm => &urls.mdm,
            Package::Sds => &urls.sds,
            Package::Sdc => &urls.sdc,
            Package::Lia => &urls.lia,
            Package::Gateway => &urls.gw,
        }
    }
}

/// Environment of the manager package install. The tiebreaker is not a
/// manager in the package's sense.
fn mdm_role_env(persona: Persona) -> &'static str {
    match persona {
        Persona::MdmPrimary | Persona::MdmSecondary => "1",
        _ => "0",
    }
}

fn rexray_config(cluster: &ClusterState, gateway: &str) -> String {
    let scaleio = &cluster.scaleio;
    format!(
        "libstorage:\n  service: scaleio\nscaleio:\n  endpoint: https://{gateway}/api\n  insecure: true\n  userName: {ADMIN_USER}\n  password: {}\n  systemName: {}\n  protectionDomainName: {}\n  storagePoolName: {}\n",
        scaleio.admin_password, scaleio.cluster_name, scaleio.protection_domain, scaleio.storage_pool,
    )
}

fn gateway_properties(manager_ips: &[String]) -> String {
    format!("mdm.ip.addresses={}\nsecurity.bypass_certificate_check=true\n", manager_ips.join(","))
}

/// Installs the ScaleIO stack with the host's package tools.
#[derive(Debug, Clone)]
pub struct Provisioner {
    family: OsFamily,
    download_dir: PathBuf,
}

impl Provisioner {
    pub fn new(family: OsFamily, download_dir: impl Into<PathBuf>) -> Self {
        Self {
            family,
            download_dir: download_dir.into(),
        }
    }

    /// Provisioner for the running host.
    pub async fn detect(download_dir: impl Into<PathBuf>) -> Result<Self, SetupError> {
        let family = OsFamily::detect().await?;
        info!(%family, "detected operating system");
        Ok(Self::new(family, download_dir))
    }

    pub fn family(&self) -> OsFamily {
        self.family
    }

    fn urls<'a>(&self, cluster: &'a ClusterState) -> &'a PackageUrls {
        match self.family {
            OsFamily::Debian => &cluster.scaleio.packages.deb,
            OsFamily::Rhel => &cluster.scaleio.packages.rpm,
        }
    }

    async fn run(&self, program: &str, args: &[&str], envs: &[(&str, &str)]) -> Result<String, SetupError> {
        let command_line = format!("{program} {}", args.join(" "));
        debug!(command = %command_line, "running");

        let output = Command::new(program)
            .args(args)
            .envs(envs.iter().copied())
            .output()
            .await?;

        if !output.status.success() {
            return Err(SetupError::CommandFailed {
                command: command_line,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn is_installed(&self, name: &str) -> bool {
        let result = match self.family {
            OsFamily::Debian => self.run("dpkg", &["-s", name], &[]).await,
            OsFamily::Rhel => self.run("rpm", &["-q", name], &[]).await,
        };
        result.is_ok()
    }

    async fn install_from_repo(&self, names: &[&str]) -> Result<(), SetupError> {
        let mut missing = Vec::new();
        for name in names {
            if !self.is_installed(name).await {
                missing.push(*name);
            }
        }
        if missing.is_empty() {
            info!(packages = ?names, "already installed");
            return Ok(());
        }

        info!(packages = ?missing, "installing");
        let mut args = vec!["-y", "install"];
        args.extend(missing);
        match self.family {
            OsFamily::Debian => self.run("apt-get", &args, &[]).await?,
            OsFamily::Rhel => self.run("yum", &args, &[]).await?,
        };
        Ok(())
    }

    async fn install_package(
        &self,
        cluster: &ClusterState,
        package: Package,
        envs: &[(&str, &str)],
    ) -> Result<(), SetupError> {
        let name = package.installed_name(self.family);
        if self.is_installed(name).await {
            info!(package = name, "already installed");
            return Ok(());
        }

        let url = package.url(self.urls(cluster));
        if url.is_empty() {
            return Err(SetupError::MissingPackage {
                package: package.label(),
                family: self.family,
            });
        }

        let local = download(url, &self.download_dir).await?;
        let local = local.to_string_lossy().into_owned();
        info!(package = name, "installing");
        match self.family {
            OsFamily::Debian => self.run("dpkg", &["-i", local.as_str()], envs).await?,
            OsFamily::Rhel => self.run("rpm", &["-i", local.as_str()], envs).await?,
        };
        Ok(())
    }

    /// Runs an install script from `url`, expecting `check` in its output.
    async fn install_script(&self, name: &str, url: &str, args: &[&str], check: &'static str) -> Result<(), SetupError> {
        let script = download(url, &self.download_dir.join(name)).await?;
        let script = script.to_string_lossy().into_owned();

        let mut full = vec![script.as_str()];
        full.extend_from_slice(args);
        let out = self.run("sh", &full, &[]).await?;

        if !out.contains(check) {
            return Err(SetupError::UnexpectedOutput {
                command: format!("sh {}", full.join(" ")),
                expected: check,
            });
        }
        Ok(())
    }

    async fn write_file(path: &Path, content: &str) -> Result<(), SetupError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

#[async_trait]
impl NodeSetup for Provisioner {
    async fn environment_setup(&self, _cluster: &ClusterState, node: &Node) -> Result<SetupOutcome, SetupError> {
        info!(hostname = %node.hostname, "environment setup");

        if self.family == OsFamily::Rhel {
            self.install_from_repo(&["libaio", "numactl"]).await?;
            return Ok(SetupOutcome::done());
        }

        self.install_from_repo(&["libaio1", "zip"]).await?;
        let kernel = format!("linux-image-{REQUIRED_KERNEL}");
        self.install_from_repo(&[kernel.as_str()]).await?;

        let running = self.run("uname", &["-r"], &[]).await?;
        if running.trim() != REQUIRED_KERNEL {
            info!(running = running.trim(), required = REQUIRED_KERNEL, "kernel installed but not running");
            return Ok(SetupOutcome::reboot());
        }
        Ok(SetupOutcome::done())
    }

    async fn management_setup(&self, cluster: &ClusterState, node: &Node) -> Result<SetupOutcome, SetupError> {
        if !node.persona.is_manager() {
            return Ok(SetupOutcome::done());
        }

        info!(hostname = %node.hostname, persona = %node.persona, "management setup");
        self.install_package(cluster, Package::Mdm, &[("MDM_ROLE_IS_MANAGER", mdm_role_env(node.persona))])
            .await?;
        Ok(SetupOutcome::done())
    }

    async fn node_setup(&self, cluster: &ClusterState, node: &Node) -> Result<SetupOutcome, SetupError> {
        let managers = cluster.manager_ips();
        if managers.is_empty() {
            return Err(SetupError::NoManagers);
        }
        let mdm_ip = managers.join(",");

        info!(hostname = %node.hostname, mdm_ip = %mdm_ip, "node setup");
        self.install_package(cluster, Package::Sds, &[]).await?;
        self.install_package(cluster, Package::Sdc, &[("MDM_IP", mdm_ip.as_str())]).await?;
        self.install_package(cluster, Package::Lia, &[("TOKEN", cluster.scaleio.admin_password.as_str())])
            .await?;
        Ok(SetupOutcome::done())
    }

    async fn gateway_setup(&self, cluster: &ClusterState, node: &Node) -> Result<SetupOutcome, SetupError> {
        if !node.persona.runs_gateway() {
            return Ok(SetupOutcome::done());
        }

        info!(hostname = %node.hostname, "gateway setup");
        self.install_package(
            cluster,
            Package::Gateway,
            &[("GATEWAY_ADMIN_PASSWORD", cluster.scaleio.admin_password.as_str())],
        )
        .await?;

        Self::write_file(Path::new(GATEWAY_PROPERTIES), &gateway_properties(&cluster.manager_ips())).await?;
        self.run("service", &["scaleio-gateway", "restart"], &[]).await?;
        Ok(SetupOutcome::done())
    }

    async fn driver_setup(&self, cluster: &ClusterState, node: &Node) -> Result<SetupOutcome, SetupError> {
        let gateway = cluster.gateway_address()?;
        let rexray = &cluster.scaleio.rexray;

        info!(hostname = %node.hostname, branch = %rexray.branch, version = %rexray.version, "installing REX-Ray");
        self.install_script("rexray", REXRAY_INSTALL_URL, &[rexray.branch.as_str(), rexray.version.as_str()], REXRAY_INSTALL_CHECK)
            .await?;
        Self::write_file(Path::new(REXRAY_CONFIG), &rexray_config(cluster, &gateway)).await?;
        Ok(SetupOutcome::done())
    }

    async fn isolator_setup(&self, cluster: &ClusterState, node: &Node) -> Result<SetupOutcome, SetupError> {
        info!(hostname = %node.hostname, "installing dvdcli");
        self.install_script("dvdcli", DVDCLI_INSTALL_URL, &[], DVDCLI_INSTALL_CHECK)
            .await?;

        let binary = &cluster.scaleio.isolator_binary;
        if binary.is_empty() {
            debug!("no isolator binary configured");
            return Ok(SetupOutcome::done());
        }

        let local = download(binary, &self.download_dir.join("isolator")).await?;
        tokio::fs::copy(&local, ISOLATOR_PATH).await?;
        info!(path = ISOLATOR_PATH, "installed isolator");
        Ok(SetupOutcome::done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scaleio_scheduler::state::{Node, NodeState};

    fn cluster() -> ClusterState {
        let mut state = ClusterState::default();
        state.scaleio.admin_password = "secret".to_string();
        state.scaleio.cluster_name = "scaleio".to_string();
        state.scaleio.protection_domain = "pd".to_string();
        state.scaleio.storage_pool = "sp".to_string();
        state.scaleio.packages.deb.mdm = "https://pkgs/mdm.deb".to_string();
        state.scaleio.packages.rpm.mdm = "https://pkgs/mdm.rpm".to_string();
        state
    }

    #[test]
    fn test_urls_follow_family() {
        let state = cluster();
        let deb = Provisioner::new(OsFamily::Debian, "/tmp");
        let rpm = Provisioner::new(OsFamily::Rhel, "/tmp");

        assert_eq!(Package::Mdm.url(deb.urls(&state)), "https://pkgs/mdm.deb");
        assert_eq!(Package::Mdm.url(rpm.urls(&state)), "https://pkgs/mdm.rpm");
        assert_eq!(Package::Sds.installed_name(OsFamily::Rhel), "EMC-ScaleIO-sds");
    }

    #[test]
    fn test_tiebreaker_is_not_a_package_manager() {
        assert_eq!(mdm_role_env(Persona::MdmPrimary), "1");
        assert_eq!(mdm_role_env(Persona::MdmSecondary), "1");
        assert_eq!(mdm_role_env(Persona::TieBreaker), "0");
    }

    #[test]
    fn test_rexray_config() {
        let config = rexray_config(&cluster(), "10.0.0.100");

        assert!(config.contains("endpoint: https://10.0.0.100/api"));
        assert!(config.contains("userName: admin"));
        assert!(config.contains("password: secret"));
        assert!(config.contains("protectionDomainName: pd"));
        assert!(config.contains("storagePoolName: sp"));
    }

    #[test]
    fn test_gateway_properties() {
        let props = gateway_properties(&["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
        assert!(props.starts_with("mdm.ip.addresses=10.0.0.1,10.0.0.2\n"));
    }

    #[tokio::test]
    async fn test_data_node_skips_manager_steps() {
        let provisioner = Provisioner::new(OsFamily::Debian, "/nonexistent");
        let mut node = Node::new("host-a", Persona::DataNode);
        node.state = NodeState::PrerequisitesInstalled;

        let outcome = provisioner.management_setup(&cluster(), &node).await.unwrap();
        assert_eq!(outcome, SetupOutcome::done());
        let outcome = provisioner.gateway_setup(&cluster(), &node).await.unwrap();
        assert_eq!(outcome, SetupOutcome::done());
    }

    #[tokio::test]
    async fn test_node_setup_needs_managers() {
        let provisioner = Provisioner::new(OsFamily::Debian, "/nonexistent");
        let node = Node::new("host-a", Persona::DataNode);

        let err = provisioner.node_setup(&cluster(), &node).await.unwrap_err();
        assert!(matches!(err, SetupError::NoManagers));
    }
}

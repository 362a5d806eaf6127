//! cloud-init NoCloud seeds: the user account and ssh key a fresh node
//! boots with.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

use crate::core::errors::{ProvisionError, ProvisionResult};
use crate::core::spec::NodeSpec;

const SUDO_RULE: &str = "ALL=(ALL) NOPASSWD:ALL";

#[derive(Debug, Serialize)]
struct CloudConfig<'a> {
    hostname: &'a str,
    ssh_pwauth: bool,
    users: Vec<CloudUser<'a>>,
    growpart: GrowPart,
    runcmd: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct CloudUser<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    sudo: Vec<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    groups: Option<&'static str>,
    shell: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ssh_authorized_keys: Vec<String>,
}

#[derive(Debug, Serialize)]
struct GrowPart {
    mode: &'static str,
    devices: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct MetaData<'a> {
    #[serde(rename = "instance-id")]
    instance_id: &'a str,
    #[serde(rename = "local-hostname")]
    local_hostname: &'a str,
}

fn seed_error(node: &str, message: impl ToString) -> ProvisionError {
    ProvisionError::Seed {
        node: node.to_string(),
        message: message.to_string(),
    }
}

/// `#cloud-config` document creating the node's login user. Password login
/// stays off; the key is the only way in.
pub fn user_data(node: &NodeSpec, authorized_key: Option<&str>) -> ProvisionResult<String> {
    let user = &node.user;
    let config = CloudConfig {
        hostname: &node.name,
        ssh_pwauth: false,
        users: vec![CloudUser {
            name: &user.name,
            sudo: if user.sudo { vec![SUDO_RULE] } else { vec![] },
            groups: user.sudo.then_some("sudo"),
            shell: "/bin/bash",
            ssh_authorized_keys: authorized_key.map(str::to_string).into_iter().collect(),
        }],
        growpart: GrowPart {
            mode: "auto",
            devices: vec!["/"],
        },
        runcmd: vec!["resize2fs /dev/vda1"],
    };

    let body = serde_yaml::to_string(&config).map_err(|e| seed_error(&node.name, e))?;
    Ok(format!("#cloud-config\n{body}"))
}

pub fn meta_data(node: &NodeSpec) -> ProvisionResult<String> {
    serde_yaml::to_string(&MetaData {
        instance_id: &node.name,
        local_hostname: &node.name,
    })
    .map_err(|e| seed_error(&node.name, e))
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), std::env::var_os("HOME")) {
        (Ok(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// The inline key wins over the key file.
pub async fn authorized_key(node: &NodeSpec) -> ProvisionResult<Option<String>> {
    let user = &node.user;
    if let Some(key) = &user.ssh_public_key {
        return Ok(Some(key.trim().to_string()));
    }
    let Some(path) = &user.ssh_public_key_path else {
        return Ok(None);
    };

    let path = expand_home(path);
    let key = tokio::fs::read_to_string(&path).await.map_err(|e| {
        seed_error(&node.name, format!("cannot read {}: {e}", path.display()))
    })?;
    Ok(Some(key.trim().to_string()))
}

/// Produces the seed image a node boots with.
#[async_trait]
pub trait NodeSeeder: Send + Sync {
    /// Path of the image as the hypervisor host sees it.
    async fn seed(&self, node: &NodeSpec) -> ProvisionResult<String>;
}

/// Builds a `cidata` ISO with `genisoimage`.
///
/// The image is written to `seed_dir` on this machine, so the directory must
/// also be readable by the hypervisor under the same path.
pub struct GenisoimageSeeder {
    seed_dir: PathBuf,
    binary: String,
}

impl GenisoimageSeeder {
    pub fn new(seed_dir: impl Into<PathBuf>, binary: &str) -> Self {
        Self {
            seed_dir: seed_dir.into(),
            binary: binary.to_string(),
        }
    }

    pub fn iso_path(&self, node: &NodeSpec) -> PathBuf {
        self.seed_dir.join(format!("{}-cloud-init.iso", node.name))
    }
}

#[async_trait]
impl NodeSeeder for GenisoimageSeeder {
    async fn seed(&self, node: &NodeSpec) -> ProvisionResult<String> {
        let key = authorized_key(node).await?;
        if key.is_none() {
            debug!(node = %node.name, "no ssh key for the node user");
        }

        let work = tempfile::tempdir()?;
        let user_data_path = work.path().join("user-data");
        let meta_data_path = work.path().join("meta-data");
        tokio::fs::write(&user_data_path, user_data(node, key.as_deref())?).await?;
        tokio::fs::write(&meta_data_path, meta_data(node)?).await?;

        tokio::fs::create_dir_all(&self.seed_dir).await?;
        let iso = self.iso_path(node);
        let output = Command::new(&self.binary)
            .arg("-output")
            .arg(&iso)
            .args(["-volid", "cidata", "-joliet", "-rock"])
            .arg(&user_data_path)
            .arg(&meta_data_path)
            .output()
            .await
            .map_err(|e| seed_error(&node.name, format!("cannot run {}: {e}", self.binary)))?;

        if !output.status.success() {
            return Err(seed_error(
                &node.name,
                format!(
                    "{} exited with {}: {}",
                    self.binary,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        info!(node = %node.name, iso = %iso.display(), "cloud-init seed written");
        Ok(iso.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::spec::fixtures::node;

    const KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOfake ops@laptop";

    #[test]
    fn user_data_grants_key_and_sudo() {
        let rendered = user_data(&node("head-1"), Some(KEY)).unwrap();
        assert!(rendered.starts_with("#cloud-config\n"));
        assert!(rendered.contains(KEY));
        assert!(rendered.contains("ALL=(ALL) NOPASSWD:ALL"));

        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        let user = &parsed["users"][0];
        assert_eq!(parsed["hostname"].as_str(), Some("head-1"));
        assert_eq!(parsed["ssh_pwauth"].as_bool(), Some(false));
        assert_eq!(user["name"].as_str(), Some("ops"));
        assert_eq!(user["groups"].as_str(), Some("sudo"));
        assert_eq!(user["ssh_authorized_keys"][0].as_str(), Some(KEY));
        assert_eq!(parsed["growpart"]["devices"][0].as_str(), Some("/"));
    }

    #[test]
    fn unprivileged_user_gets_no_sudo_rule() {
        let mut spec = node("worker-1");
        spec.user.sudo = false;
        let rendered = user_data(&spec, None).unwrap();
        assert!(!rendered.contains("NOPASSWD"));
        assert!(!rendered.contains("ssh_authorized_keys"));
        assert!(!rendered.contains("groups"));
    }

    #[test]
    fn meta_data_names_the_instance() {
        let rendered = meta_data(&node("worker-2")).unwrap();
        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["instance-id"].as_str(), Some("worker-2"));
        assert_eq!(parsed["local-hostname"].as_str(), Some("worker-2"));
    }

    #[tokio::test]
    async fn inline_key_wins_over_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("id_ed25519.pub");
        std::fs::write(&key_file, "ssh-ed25519 AAAAfile ops@file\n").unwrap();

        let mut spec = node("head-1");
        spec.user.ssh_public_key_path = Some(key_file);
        assert_eq!(
            authorized_key(&spec).await.unwrap().as_deref(),
            Some("ssh-ed25519 AAAAfile ops@file")
        );

        spec.user.ssh_public_key = Some(format!("{KEY}\n"));
        assert_eq!(authorized_key(&spec).await.unwrap().as_deref(), Some(KEY));
    }

    #[tokio::test]
    async fn missing_key_file_fails_the_seed() {
        let mut spec = node("head-1");
        spec.user.ssh_public_key_path = Some(PathBuf::from("/nonexistent/id.pub"));
        assert!(matches!(
            authorized_key(&spec).await,
            Err(ProvisionError::Seed { .. })
        ));
    }

    #[test]
    fn tilde_expands_to_home() {
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home(Path::new("~/.ssh/id.pub")),
                PathBuf::from(home).join(".ssh/id.pub")
            );
        }
        assert_eq!(expand_home(Path::new("/etc/key")), PathBuf::from("/etc/key"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn seed_iso_is_built_from_both_documents() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        // stand-in for genisoimage: concatenates its inputs into -output
        let tool = dir.path().join("mkiso");
        std::fs::write(
            &tool,
            "#!/bin/sh\n\
             out=''\n\
             files=''\n\
             while [ \"$#\" -gt 0 ]; do\n\
               case \"$1\" in\n\
                 -output) out=\"$2\"; shift ;;\n\
                 -volid) [ \"$2\" = cidata ] || exit 3; shift ;;\n\
                 -*) ;;\n\
                 *) files=\"$files $1\" ;;\n\
               esac\n\
               shift\n\
             done\n\
             cat $files > \"$out\"\n",
        )
        .unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let seeds = dir.path().join("seeds");
        let seeder = GenisoimageSeeder::new(&seeds, &tool.display().to_string());
        let mut spec = node("head-1");
        spec.user.ssh_public_key = Some(KEY.to_string());

        let iso = seeder.seed(&spec).await.unwrap();
        assert_eq!(PathBuf::from(&iso), seeds.join("head-1-cloud-init.iso"));
        let contents = std::fs::read_to_string(&iso).unwrap();
        assert!(contents.contains(KEY));
        assert!(contents.contains("instance-id: head-1"));
    }

    #[tokio::test]
    async fn failing_tool_is_a_seed_error() {
        let dir = tempfile::tempdir().unwrap();
        let seeder = GenisoimageSeeder::new(dir.path(), "false");
        assert!(matches!(
            seeder.seed(&node("head-1")).await,
            Err(ProvisionError::Seed { .. })
        ));

        let missing = GenisoimageSeeder::new(dir.path(), "/nonexistent/genisoimage");
        assert!(missing.seed(&node("head-1")).await.is_err());
    }
}

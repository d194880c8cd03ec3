//! Static assignment catalog construction from the settings document.

use bytes::Bytes;
use ipnet::IpNet;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use hds_core::{Assignment, AssignmentKind, value_at};

/// Worker kinds that get a default static assignment.
const DEFAULT_WORKER_KINDS: [AssignmentKind; 5] = [
    AssignmentKind::AudioMixer,
    AssignmentKind::AvatarMixer,
    AssignmentKind::AssetServer,
    AssignmentKind::EntityServer,
    AssignmentKind::MessagesMixer,
];

/// A persisted scripted job from settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PersistentScript {
    /// Script URL handed to the agent.
    pub url: String,
    /// How many copies to keep running.
    #[serde(default = "default_instances")]
    pub num_instances: u32,
    /// Pool the job belongs to.
    #[serde(default)]
    pub pool: String,
}

const fn default_instances() -> u32 {
    1
}

/// Build the static assignment catalog from settings.
///
/// One default static assignment per worker kind not named in
/// `assignments.disabled_types`, plus one static Agent assignment per
/// persisted script instance in `scripts.persistent_scripts`.
#[must_use]
pub fn static_assignments_from_settings(root: &Value) -> Vec<Assignment> {
    let disabled: Vec<AssignmentKind> = value_at(root, "assignments.disabled_types")
        .cloned()
        .map(|value| serde_json::from_value(value).unwrap_or_default())
        .unwrap_or_default();

    let mut catalog: Vec<Assignment> = DEFAULT_WORKER_KINDS
        .into_iter()
        .filter(|kind| !disabled.contains(kind))
        .map(Assignment::new_static)
        .collect();

    if let Some(scripts) = value_at(root, "scripts.persistent_scripts") {
        match serde_json::from_value::<Vec<PersistentScript>>(scripts.clone()) {
            Ok(scripts) => {
                for script in scripts {
                    for _ in 0..script.num_instances {
                        catalog.push(
                            Assignment::new_static(AssignmentKind::Agent)
                                .with_pool(script.pool.clone())
                                .with_payload(Bytes::from(script.url.clone().into_bytes())),
                        );
                    }
                }
            }
            Err(error) => warn!(%error, "ignoring malformed persistent_scripts settings"),
        }
    }

    catalog
}

/// Subnets allowed to request assignments.
///
/// Read from `security.ac_subnet_whitelist`; with nothing configured every
/// address is allowed.
#[must_use]
pub fn allowed_subnets_from_settings(root: &Value) -> Vec<IpNet> {
    let configured = value_at(root, "security.ac_subnet_whitelist")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|raw| match raw.parse::<IpNet>() {
                    Ok(subnet) => Some(subnet),
                    Err(error) => {
                        warn!(subnet = raw, %error, "ignoring malformed subnet in whitelist");
                        None
                    }
                })
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    if configured.is_empty() {
        vec!["0.0.0.0/0".parse().expect("valid"), "::/0".parse().expect("valid")]
    } else {
        configured
    }
}

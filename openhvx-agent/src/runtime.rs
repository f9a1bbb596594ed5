//! Process-wide runtime context exposed to action scripts
//!
//! Built once at boot, after the managed tree is ensured, and shared as an
//! `Arc` from then on. Scripts receive it serialized under the `__ctx` key so
//! they can resolve placement without embedding any path policy themselves.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::datadirs::DataDirs;

/// One named datastore the host exposes to action scripts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatastoreDescriptor {
    pub name: String,
    /// One of `root`, `vm`, `vhd`, `image`, `iso`, `checkpoint`, `logs`.
    pub kind: String,
    pub path: String,
    pub read_only: bool,
}

/// Agent identity plus the managed paths and datastore descriptors.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeContext {
    pub agent_id: String,
    pub base_path: String,
    pub paths: BTreeMap<String, String>,
    pub datastores: Vec<DatastoreDescriptor>,
}

impl RuntimeContext {
    /// Context for a host with a managed tree.
    pub fn new(agent_id: &str, base_path: &str, dirs: &DataDirs) -> Self {
        let path = |p: &std::path::Path| p.display().to_string();
        let paths = BTreeMap::from([
            ("root".to_string(), path(&dirs.root)),
            ("vms".to_string(), path(&dirs.vms)),
            ("vhd".to_string(), path(&dirs.vhd)),
            ("images".to_string(), path(&dirs.images)),
            ("isos".to_string(), path(&dirs.isos)),
            ("checkpoints".to_string(), path(&dirs.checkpoints)),
            ("logs".to_string(), path(&dirs.logs)),
            ("trash".to_string(), path(&dirs.trash)),
        ]);
        let ds = |name: &str, kind: &str, p: &std::path::Path, read_only: bool| {
            DatastoreDescriptor {
                name: name.to_string(),
                kind: kind.to_string(),
                path: path(p),
                read_only,
            }
        };
        let datastores = vec![
            ds("OpenHVX Root", "root", &dirs.root, false),
            ds("OpenHVX VMS", "vm", &dirs.vms, false),
            ds("OpenHVX VHD", "vhd", &dirs.vhd, false),
            // Images hold golden masters; ISOs are legacy media. Both stay
            // read-only for scripts.
            ds("OpenHVX Images", "image", &dirs.images, true),
            ds("OpenHVX ISOs", "iso", &dirs.isos, true),
            ds("OpenHVX Checkpoints", "checkpoint", &dirs.checkpoints, false),
            ds("OpenHVX Logs", "logs", &dirs.logs, false),
        ];
        Self {
            agent_id: agent_id.to_string(),
            base_path: base_path.to_string(),
            paths,
            datastores,
        }
    }

    /// Context for a host without a configured base path: identity only,
    /// empty paths and datastores (inventory then reports none).
    pub fn without_tree(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            base_path: String::new(),
            paths: BTreeMap::new(),
            datastores: Vec::new(),
        }
    }

    /// The `__ctx` object handed to scripts.
    pub fn to_ctx_value(&self) -> Value {
        serde_json::json!({
            "agentId": self.agent_id,
            "basePath": self.base_path,
            "paths": self.paths,
            "datastores": self.datastores,
        })
    }

    /// The `datastores` parameter passed to inventory actions.
    pub fn datastores_value(&self) -> Value {
        serde_json::to_value(&self.datastores).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_cover_every_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = DataDirs::ensure(tmp.path().to_str().unwrap()).unwrap();
        let ctx = RuntimeContext::new("HOST-A", tmp.path().to_str().unwrap(), &dirs);

        let kinds: Vec<&str> = ctx.datastores.iter().map(|d| d.kind.as_str()).collect();
        assert_eq!(
            kinds,
            ["root", "vm", "vhd", "image", "iso", "checkpoint", "logs"]
        );
        let images = ctx.datastores.iter().find(|d| d.kind == "image").unwrap();
        assert!(images.read_only);
        assert!(!ctx.datastores[0].read_only);
    }

    #[test]
    fn ctx_value_shape() {
        let ctx = RuntimeContext::without_tree("HOST-A");
        let v = ctx.to_ctx_value();
        assert_eq!(v["agentId"], "HOST-A");
        assert_eq!(v["basePath"], "");
        assert!(v["datastores"].as_array().unwrap().is_empty());
    }

    #[test]
    fn descriptor_serializes_camel_case() {
        let d = DatastoreDescriptor {
            name: "OpenHVX Images".into(),
            kind: "image".into(),
            path: "/data/openhvx/Images".into(),
            read_only: true,
        };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["readOnly"], true);
        assert!(v.get("read_only").is_none());
    }
}

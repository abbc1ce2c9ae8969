//! OCI-like box specification: the subset of the runtime spec this runtime
//! consumes, plus its validation rules.
//!
//! Reference: <https://github.com/opencontainers/runtime-spec/blob/master/config.md>

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{BoxError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Spec {
    #[serde(rename = "ociVersion")]
    pub version: String,
    pub process: Process,
    pub root: Root,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    pub cwd: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Root {
    pub path: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

impl Spec {
    /// Reads and validates a spec file.
    pub fn load(path: impl AsRef<Path>) -> Result<Spec> {
        let file = File::open(path.as_ref())
            .map_err(|e| BoxError::Validation(format!("unable to open spec file: {}", e)))?;
        Spec::from_reader(file)
    }

    pub fn from_reader(rd: impl Read) -> Result<Spec> {
        let spec: Spec = serde_json::from_reader(rd)
            .map_err(|e| BoxError::Validation(format!("decoding spec: {}", e)))?;
        spec.validate()?;
        Ok(spec)
    }

    /// Rejects specs this runtime cannot honor. Only version 1.0.1 is
    /// supported.
    pub fn validate(&self) -> Result<()> {
        if self.version.is_empty() {
            return Err(BoxError::Validation(
                "spec version must be specified".into(),
            ));
        }
        let parts: Vec<&str> = self.version.split('.').collect();
        if parts.len() != 3 || parts[0] != "1" || parts[1] != "0" || parts[2] != "1" {
            return Err(BoxError::Validation("spec version not supported".into()));
        }

        self.process.validate()?;
        self.root.validate()
    }
}

impl Process {
    fn validate(&self) -> Result<()> {
        if self.cwd.is_empty() {
            return Err(BoxError::Validation(
                "cwd property must not be empty".into(),
            ));
        }
        if !Path::new(&self.cwd).is_absolute() {
            return Err(BoxError::Validation("cwd must be an absolute path".into()));
        }
        if self.args.is_empty() {
            return Err(BoxError::Validation("args list must not be empty".into()));
        }
        Ok(())
    }
}

impl Root {
    fn validate(&self) -> Result<()> {
        if self.readonly {
            return Err(BoxError::Validation("read-only root not supported".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_spec() -> Spec {
        Spec {
            version: "1.0.1".into(),
            process: Process {
                terminal: false,
                args: vec!["/bin/true".into()],
                env: vec![],
                cwd: "/".into(),
            },
            root: Root {
                path: "/tmp/rootfs".into(),
                readonly: false,
            },
            hostname: String::new(),
        }
    }

    #[test]
    fn accepts_version_1_0_1() {
        assert!(valid_spec().validate().is_ok());
    }

    #[test]
    fn rejects_other_versions() {
        for v in ["", "1.0", "1.0.2", "2.0.1", "1.1.1", "1.0.1.0", "abc"] {
            let mut spec = valid_spec();
            spec.version = v.into();
            assert!(spec.validate().is_err(), "version {:?} accepted", v);
        }
    }

    #[test]
    fn rejects_empty_args() {
        let mut spec = valid_spec();
        spec.process.args.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_relative_cwd() {
        let mut spec = valid_spec();
        spec.process.cwd = "work".into();
        assert!(spec.validate().is_err());

        spec.process.cwd = String::new();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_readonly_root() {
        let mut spec = valid_spec();
        spec.root.readonly = true;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn decodes_oci_field_names() {
        let raw = r#"{
            "ociVersion": "1.0.1",
            "process": {"args": ["/bin/sh", "-c", "true"], "env": ["A=1"], "cwd": "/"},
            "root": {"path": "/srv/rootfs"},
            "hostname": "box1"
        }"#;
        let spec = Spec::from_reader(raw.as_bytes()).unwrap();
        assert_eq!(spec.process.args.len(), 3);
        assert_eq!(spec.root.path, PathBuf::from("/srv/rootfs"));
        assert_eq!(spec.hostname, "box1");
    }

    #[test]
    fn load_surfaces_validation_errors() {
        let raw = r#"{
            "ociVersion": "1.0.0",
            "process": {"args": ["/bin/true"], "cwd": "/"},
            "root": {"path": "/srv/rootfs"}
        }"#;
        let err = Spec::from_reader(raw.as_bytes()).unwrap_err();
        assert!(matches!(err, BoxError::Validation(_)));
    }
}

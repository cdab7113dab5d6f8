// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! YAML cloud spec files for `flotilla apply`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use flotilla_core::CloudSpec;

/// Read the cloud spec at `path`.
pub fn load(path: &Path) -> Result<CloudSpec> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse(&text).with_context(|| format!("invalid cloud spec {}", path.display()))
}

fn parse(text: &str) -> Result<CloudSpec> {
    let spec: CloudSpec = serde_yaml::from_str(text)?;
    if spec.remote_user.trim().is_empty() {
        bail!("remote_user must not be empty");
    }
    Ok(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_core::PackageManager;

    #[test]
    fn test_parse_full_spec() {
        let spec = parse(
            "instance_type: t3.small\n\
             image_id: ami-0abc1234\n\
             desired_count: 3\n\
             package_manager: apt\n\
             remote_user: ubuntu\n\
             prerequisites: [git]\n",
        )
        .unwrap();

        assert_eq!(spec.instance_type, "t3.small");
        assert_eq!(spec.desired_count, 3);
        assert_eq!(spec.package_manager, PackageManager::Apt);
        assert_eq!(spec.remote_user, "ubuntu");
        assert_eq!(spec.prerequisite_packages(), vec!["git".to_string()]);
    }

    #[test]
    fn test_parse_defaults() {
        let spec = parse("desired_count: 0\n").unwrap();

        assert_eq!(spec.remote_user, "ec2-user");
        assert_eq!(spec.package_manager, PackageManager::Yum);
        assert!(spec.image_id.is_empty());
    }

    #[test]
    fn test_rejects_unknown_package_manager() {
        assert!(parse("package_manager: pacman\n").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/fleet.yml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/fleet.yml"));
    }
}

//! Artifact locations inside a project's binaries dataset.

use crate::{DloopError, DloopResult};

pub const ARTIFACTS_ROOT: &str = "/artifacts";

/// Remote folder for artifacts of a package and/or an execution.
pub fn remote_dir(package_name: Option<&str>, execution_id: Option<&str>) -> DloopResult<String> {
    if package_name.is_none() && execution_id.is_none() {
        return Err(DloopError::validation("must input package or execution (id or entity)"));
    }
    let mut path = String::from(ARTIFACTS_ROOT);
    if let Some(p) = package_name {
        path.push_str("/packages/");
        path.push_str(p);
    }
    if let Some(e) = execution_id {
        path.push_str("/executions/");
        path.push_str(e);
    }
    Ok(path)
}

/// Filename filter matching every artifact under the folder.
/// Listing without package or execution covers all project artifacts.
pub fn listing_glob(package_name: Option<&str>, execution_id: Option<&str>) -> String {
    let dir = remote_dir(package_name, execution_id).unwrap_or_else(|_| ARTIFACTS_ROOT.to_string());
    format!("{}/*", dir)
}

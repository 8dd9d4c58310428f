//! `features` - the static capability document.

use serde_json::{json, Value};

use crate::hooks::Phase;

/// Mount option names the runtime recognizes: flag options, pseudo
/// options, control options and the silently ignored set.
const MOUNT_OPTIONS: &[&str] = &[
    // Feature options
    "async",
    "atime",
    "exec",
    "suid",
    "symfollow",
    "rdonly",
    "sync",
    "union",
    "userquota",
    "groupquota",
    "clusterr",
    "clusterw",
    "suiddir",
    "snapshot",
    "multilabel",
    "acls",
    "nfsv4acls",
    "automounted",
    "untrusted",
    // Pseudo options
    "tmpcopyup",
    "rule",
    // Control options
    "force",
    "update",
    "ro",
    "rw",
    "cover",
    "emptydir",
    // Ignored options
    "private",
    "rprivate",
    "rbind",
    "nodev",
    "bind",
];

pub fn document() -> Value {
    json!({
        "ociVersionMin": "1.0.0",
        "ociVersionMax": "1.1.0",
        "hooks": Phase::ALL.iter().map(Phase::as_str).collect::<Vec<_>>(),
        "mountOptions": MOUNT_OPTIONS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_shape() {
        let doc = document();
        assert_eq!(doc["ociVersionMin"], "1.0.0");
        assert_eq!(doc["ociVersionMax"], "1.1.0");
        assert_eq!(doc["hooks"].as_array().unwrap().len(), 6);
        let options = doc["mountOptions"].as_array().unwrap();
        for name in ["ro", "rw", "tmpcopyup", "rule", "bind", "nodev"] {
            assert!(options.iter().any(|o| o == name), "missing {name}");
        }
    }

    #[test]
    fn version_ceiling_matches_create() {
        // create accepts 1.0.x and 1.1.x; the advertised ceiling agrees.
        assert_eq!(document()["ociVersionMax"], "1.1.0");
    }
}

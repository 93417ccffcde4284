//! Built-in tables the policy builder draws on.
//!
//! Everything here is fixed data: environment rules the runtime injects
//! into every container, sandbox mount sources, sidecar images and the
//! default infrastructure fragment.

use std::sync::LazyLock;

use super::{EnvRule, EnvStrategy, ExecProcess, FragmentInclude, FragmentRef, MountRule};

/// Tag on a container group that suppresses default and pulled fragments.
pub const ZERO_SIDECAR_TAG: &str = "Annotate-zero-sidecar";

/// Mount type used for every sandbox-backed mount.
pub const MOUNT_TYPE: &str = "bind";

/// Destination of the config-map volume mounted into opted-in containers.
pub const CONFIG_MAP_MOUNT_PATH: &str = "/mnt/configmap";

struct BuiltinEnvRule {
    pattern: &'static str,
    strategy: EnvStrategy,
}

const fn literal(pattern: &'static str) -> BuiltinEnvRule {
    BuiltinEnvRule {
        pattern,
        strategy: EnvStrategy::String,
    }
}

const fn re2(pattern: &'static str) -> BuiltinEnvRule {
    BuiltinEnvRule {
        pattern,
        strategy: EnvStrategy::Re2,
    }
}

/// Guest-agent variables.
const OPENGCS_ENV_RULES: &[BuiltinEnvRule] = &[literal("TERM=xterm")];

/// Variables injected by the fabric host.
const FABRIC_ENV_RULES: &[BuiltinEnvRule] = &[
    re2("(?i)(FABRIC)_.+=.+"),
    re2("HOSTNAME=.+"),
    re2("T(E)?MP=.+"),
    re2("FabricPackageFileName=.+"),
    re2("HostedServiceName=.+"),
];

/// Managed identity endpoint variables.
const MANAGED_IDENTITY_ENV_RULES: &[BuiltinEnvRule] = &[
    re2("IDENTITY_API_VERSION=.+"),
    re2("IDENTITY_HEADER=.+"),
    re2("IDENTITY_SERVER_THUMBPRINT=.+"),
];

/// Set when the platform restarts a container.
const RESTART_ENV_RULES: &[BuiltinEnvRule] = &[re2("azurecontainerinstance_restarted_by=.+")];

/// Every built-in env rule, in emission order.
pub static BUILTIN_ENV_RULES: LazyLock<Vec<EnvRule>> = LazyLock::new(|| {
    [
        OPENGCS_ENV_RULES,
        FABRIC_ENV_RULES,
        MANAGED_IDENTITY_ENV_RULES,
        RESTART_ENV_RULES,
    ]
    .iter()
    .flat_map(|set| set.iter())
    .map(|rule| EnvRule {
        pattern: rule.pattern.to_owned(),
        strategy: rule.strategy,
        required: false,
    })
    .collect()
});

/// Volume kind → sandbox source pattern.
const MOUNT_SOURCES: &[(&str, &str)] = &[
    ("azureFile", "sandbox:///tmp/atlas/azureFileVolume/.+"),
    ("secret", "sandbox:///tmp/atlas/secretsVolume/.+"),
    ("emptyDir", "sandbox:///tmp/atlas/emptydir/.+"),
    ("gitRepo", "sandbox:///tmp/atlas/gitRepoVolume/.+"),
    ("configMap", "sandbox:///tmp/atlas/configmap/.+"),
    ("resolvconf", "sandbox:///tmp/atlas/resolvconf/.+"),
];

/// Mounts every non-sidecar container receives: `(kind, destination, readonly)`.
const DEFAULT_USER_MOUNTS: &[(&str, &str, bool)] = &[("resolvconf", "/etc/resolv.conf", false)];

/// Images that run as platform sidecars. Matched without tag or digest.
const SIDECAR_IMAGES: &[&str] = &[
    "mcr.microsoft.com/aci/msi-atlas-adapter",
    "mcr.microsoft.com/aci/atlas-adapter",
];

/// Shells allowed by exec when debug mode is on.
const DEBUG_SHELLS: &[&str] = &["/bin/sh", "/bin/bash"];

/// Issuer of the default infrastructure fragment.
pub const DEFAULT_INFRA_ISSUER: &str =
    "did:x509:0:sha256:I__iuL25oXEVFdTP_aBLx_eT1RPHbCQ_ECBQfYZpt9s::eku:1.3.6.1.4.1.311.76.59.1.3";

/// Feed of the default infrastructure fragment.
pub const DEFAULT_INFRA_FEED: &str = "mcr.microsoft.com/aci/aci-cc-infra-fragment";

/// Minimum SVN of the default infrastructure fragment.
pub const DEFAULT_INFRA_SVN: &str = "1";

const SIGNALS: &[(&str, i32)] = &[
    ("SIGHUP", 1),
    ("SIGINT", 2),
    ("SIGQUIT", 3),
    ("SIGKILL", 9),
    ("SIGUSR1", 10),
    ("SIGUSR2", 12),
    ("SIGTERM", 15),
    ("SIGCONT", 18),
    ("SIGSTOP", 19),
];

/// Sandbox mount rule for a volume of `kind`, or `None` for unknown kinds.
pub fn mount_rule(kind: &str, destination: &str, readonly: bool) -> Option<MountRule> {
    let (_, source) = MOUNT_SOURCES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(kind))?;
    let options = if readonly {
        vec!["rbind".to_owned(), "rshared".to_owned(), "ro".to_owned()]
    } else {
        vec!["rbind".to_owned(), "rshared".to_owned(), "rw".to_owned()]
    };
    Some(MountRule {
        destination: destination.to_owned(),
        source: (*source).to_owned(),
        mount_type: MOUNT_TYPE.to_owned(),
        options,
    })
}

/// Default mounts for `image`; empty for sidecars.
pub fn default_user_mounts(image: &str) -> Vec<MountRule> {
    if is_sidecar(image) {
        return Vec::new();
    }
    DEFAULT_USER_MOUNTS
        .iter()
        .filter_map(|(kind, destination, readonly)| mount_rule(kind, destination, *readonly))
        .collect()
}

/// Whether `image` is a known platform sidecar.
pub fn is_sidecar(image: &str) -> bool {
    let name = crate::registry::reference::strip_tag_or_digest(image);
    SIDECAR_IMAGES.contains(&name)
}

/// Debug shells as exec processes.
pub fn debug_exec_processes() -> Vec<ExecProcess> {
    DEBUG_SHELLS
        .iter()
        .map(|shell| ExecProcess {
            command: vec![(*shell).to_owned()],
            signals: Vec::new(),
        })
        .collect()
}

/// Translate a signal name (`SIGTERM`, `TERM`) to its number.
pub fn signal_number(name: &str) -> Option<i32> {
    let upper = name.trim().to_ascii_uppercase();
    let full = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{upper}")
    };
    SIGNALS
        .iter()
        .find(|(signal, _)| *signal == full)
        .map(|(_, number)| *number)
}

/// The default infrastructure fragment, optionally with a raised minimum SVN.
pub fn default_infra_fragment(minimum_svn: Option<&str>) -> FragmentRef {
    FragmentRef::new(
        DEFAULT_INFRA_ISSUER,
        DEFAULT_INFRA_FEED,
        minimum_svn.unwrap_or(DEFAULT_INFRA_SVN),
        [FragmentInclude::Containers, FragmentInclude::Fragments],
    )
}

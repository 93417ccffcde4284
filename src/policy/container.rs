//! Per-container rule extraction shared by the ARM and spec-file builders.

use serde_json::Value;
use tracing::{debug, warn};

use super::defaults::{self, BUILTIN_ENV_RULES, CONFIG_MAP_MOUNT_PATH};
use super::{
    BuildOptions, Capabilities, ContainerSpec, EnvRule, ExecProcess, MountRule, SecurityContext,
    WildcardApprover,
};
use crate::error::{ConfcomError, Result};
use crate::template::{contains_reference, get_ci};

/// Where a container declaration came from; the two formats spell env
/// variables and mounts differently.
pub(crate) enum Source<'a> {
    /// ARM template container with the group's `volumes`.
    ArmTemplate {
        /// The group's declared volumes.
        volumes: &'a [Value],
    },
    /// Standalone policy spec file container.
    SpecFile,
}

/// Compile one `{name, properties}` container declaration.
pub(crate) fn compile(
    declaration: &Value,
    source: &Source<'_>,
    options: &BuildOptions,
    approver: &dyn WildcardApprover,
) -> Result<ContainerSpec> {
    let properties = get_ci(declaration, "properties").unwrap_or(declaration);
    let image = string_field(properties, "image")?.ok_or_else(|| {
        ConfcomError::UserInput("field [\"image\"] is empty or cannot be found".to_owned())
    })?;
    let name = string_field(declaration, "name")?.unwrap_or_else(|| image.clone());

    let mut env_rules = match source {
        Source::ArmTemplate { .. } => template_env_rules(&name, properties, options, approver)?,
        Source::SpecFile => spec_file_env_rules(properties)?,
    };
    env_rules.extend(BUILTIN_ENV_RULES.iter().cloned());

    let mut mounts = match source {
        Source::ArmTemplate { volumes } => template_mounts(properties, volumes)?,
        Source::SpecFile => spec_file_mounts(properties)?,
    };
    if get_ci(properties, "configMap").is_some() {
        mounts.extend(defaults::mount_rule("configMap", CONFIG_MAP_MOUNT_PATH, false));
    }
    mounts.extend(defaults::default_user_mounts(&image));

    let mut exec_processes = declared_exec_processes(properties)?;
    exec_processes.extend(probe_exec_processes(properties)?);
    if options.debug_mode {
        exec_processes.extend(defaults::debug_exec_processes());
    }

    Ok(ContainerSpec {
        command: string_list(properties, "command")?.unwrap_or_default(),
        signals: signal_list(properties, "signals")?.unwrap_or_default(),
        security_context: security_context(properties)?,
        allow_stdio_access: options.allow_stdio_access,
        id: image,
        name,
        env_rules,
        mounts,
        exec_processes,
    })
}

fn template_env_rules(
    container: &str,
    properties: &Value,
    options: &BuildOptions,
    approver: &dyn WildcardApprover,
) -> Result<Vec<EnvRule>> {
    let mut rules = Vec::new();
    for variable in array_field(properties, "environmentVariables")? {
        let name = required_string(variable, "name", "environment variable")?;
        let value = get_ci(variable, "value")
            .or_else(|| get_ci(variable, "secureValue"))
            .ok_or_else(|| {
                ConfcomError::UserInput(format!(
                    "environment variable [\"{name}\"] in container {container} has neither value nor secureValue"
                ))
            })?;
        let value = scalar_text(value).ok_or_else(|| {
            ConfcomError::UserInput(format!(
                "environment variable [\"{name}\"] in container {container} must have a scalar value"
            ))
        })?;

        if contains_reference(&value) {
            if options.approve_wildcards || approver.approve(container, &name) {
                debug!(container, variable = %name, "emitting wildcard env rule");
                rules.push(EnvRule::wildcard(&name));
            } else {
                warn!(
                    container,
                    variable = %name,
                    "skipping environment variable with unresolved value"
                );
            }
            continue;
        }
        rules.push(EnvRule::literal(&name, &value));
    }
    Ok(rules)
}

fn spec_file_env_rules(properties: &Value) -> Result<Vec<EnvRule>> {
    let mut rules = Vec::new();
    for variable in array_field(properties, "environmentVariables")? {
        let name = required_string(variable, "name", "environment variable")?;
        let value = get_ci(variable, "value")
            .and_then(scalar_text)
            .ok_or_else(|| {
                ConfcomError::UserInput(format!(
                    "environment variable [\"{name}\"] must have a scalar value"
                ))
            })?;
        let is_regex = match get_ci(variable, "regex") {
            None => false,
            Some(Value::Bool(flag)) => *flag,
            Some(other) => {
                return Err(ConfcomError::UserInput(format!(
                    "environment variable [\"{name}\"]: [\"regex\"] must be a boolean, got {other}"
                )))
            }
        };
        rules.push(if is_regex {
            EnvRule::regex(&name, &value)
        } else {
            EnvRule::literal(&name, &value)
        });
    }
    Ok(rules)
}

fn template_mounts(properties: &Value, volumes: &[Value]) -> Result<Vec<MountRule>> {
    let mut mounts = Vec::new();
    for mount in array_field(properties, "volumeMounts")? {
        let volume_name = required_string(mount, "name", "volume mount")?;
        let destination = required_string(mount, "mountPath", "volume mount")?;
        let readonly = bool_field(mount, "readOnly")?;

        let volume = volumes
            .iter()
            .find(|volume| {
                get_ci(volume, "name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| name == volume_name)
            })
            .ok_or_else(|| {
                ConfcomError::UserInput(format!(
                    "volume mount [\"{volume_name}\"] does not match any declared volume"
                ))
            })?;

        let rule = volume
            .as_object()
            .into_iter()
            .flat_map(|object| object.keys())
            .find_map(|kind| defaults::mount_rule(kind, &destination, readonly))
            .ok_or_else(|| {
                ConfcomError::UserInput(format!(
                    "volume [\"{volume_name}\"] has no supported volume type"
                ))
            })?;
        mounts.push(rule);
    }
    Ok(mounts)
}

fn spec_file_mounts(properties: &Value) -> Result<Vec<MountRule>> {
    let mut mounts = Vec::new();
    for mount in array_field(properties, "volumeMounts")? {
        let kind = required_string(mount, "mountType", "volume mount")?;
        let destination = required_string(mount, "mountPath", "volume mount")?;
        let readonly = bool_field(mount, "readonly")?;
        let rule = defaults::mount_rule(&kind, &destination, readonly).ok_or_else(|| {
            ConfcomError::UserInput(format!("unsupported volume mount type [\"{kind}\"]"))
        })?;
        mounts.push(rule);
    }
    Ok(mounts)
}

fn declared_exec_processes(properties: &Value) -> Result<Vec<ExecProcess>> {
    array_field(properties, "execProcesses")?
        .iter()
        .map(|process| {
            let command = string_list(process, "command")?.ok_or_else(|| {
                ConfcomError::UserInput(
                    "exec process must declare a [\"command\"] list".to_owned(),
                )
            })?;
            Ok(ExecProcess {
                command,
                signals: signal_list(process, "signals")?.unwrap_or_default(),
            })
        })
        .collect()
}

fn probe_exec_processes(properties: &Value) -> Result<Vec<ExecProcess>> {
    let mut processes = Vec::new();
    for probe in ["readinessProbe", "livenessProbe"] {
        let Some(exec) = get_ci(properties, probe).and_then(|p| get_ci(p, "exec")) else {
            continue;
        };
        let command = string_list(exec, "command")?.ok_or_else(|| {
            ConfcomError::UserInput(format!(
                "[\"{probe}\"] exec must declare a [\"command\"] list"
            ))
        })?;
        processes.push(ExecProcess {
            command,
            signals: Vec::new(),
        });
    }
    Ok(processes)
}

fn security_context(properties: &Value) -> Result<Option<SecurityContext>> {
    let Some(context) = get_ci(properties, "securityContext") else {
        return Ok(None);
    };
    if !context.is_object() {
        return Err(ConfcomError::UserInput(
            "[\"securityContext\"] must be an object".to_owned(),
        ));
    }

    let capabilities = match get_ci(context, "capabilities") {
        None => None,
        Some(caps) => Some(Capabilities {
            add: string_list(caps, "add")?.unwrap_or_default(),
            drop: string_list(caps, "drop")?.unwrap_or_default(),
        }),
    };

    Ok(Some(SecurityContext {
        privileged: optional_bool(context, "privileged")?,
        allow_privilege_escalation: optional_bool(context, "allowPrivilegeEscalation")?,
        run_as_user: optional_int(context, "runAsUser")?,
        run_as_group: optional_int(context, "runAsGroup")?,
        capabilities,
    }))
}

/// Text form of a string, number or boolean.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn array_field<'a>(value: &'a Value, key: &str) -> Result<&'a [Value]> {
    match get_ci(value, key) {
        None => Ok(&[]),
        Some(Value::Array(items)) => Ok(items),
        Some(_) => Err(ConfcomError::UserInput(format!(
            "field [\"{key}\"] can only be a list value"
        ))),
    }
}

fn string_field(value: &Value, key: &str) -> Result<Option<String>> {
    match get_ci(value, key) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(ConfcomError::UserInput(format!(
            "field [\"{key}\"] can only be a string value"
        ))),
    }
}

fn required_string(value: &Value, key: &str, what: &str) -> Result<String> {
    string_field(value, key)?.ok_or_else(|| {
        ConfcomError::UserInput(format!("{what} is missing field [\"{key}\"]"))
    })
}

fn string_list(value: &Value, key: &str) -> Result<Option<Vec<String>>> {
    let Some(raw) = get_ci(value, key) else {
        return Ok(None);
    };
    raw.as_array()
        .and_then(|items| {
            items
                .iter()
                .map(|item| item.as_str().map(ToOwned::to_owned))
                .collect::<Option<Vec<_>>>()
        })
        .map(Some)
        .ok_or_else(|| {
            ConfcomError::UserInput(format!("field [\"{key}\"] can only be a list of strings"))
        })
}

fn signal_list(value: &Value, key: &str) -> Result<Option<Vec<i32>>> {
    let Some(raw) = get_ci(value, key) else {
        return Ok(None);
    };
    let items = raw.as_array().ok_or_else(|| {
        ConfcomError::UserInput(format!("field [\"{key}\"] can only be a list value"))
    })?;
    items
        .iter()
        .map(|item| {
            let number = match item {
                Value::String(name) => defaults::signal_number(name),
                Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
                _ => None,
            };
            number.ok_or_else(|| ConfcomError::UserInput(format!("unknown signal {item}")))
        })
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

fn bool_field(value: &Value, key: &str) -> Result<bool> {
    Ok(optional_bool(value, key)?.unwrap_or(false))
}

fn optional_bool(value: &Value, key: &str) -> Result<Option<bool>> {
    match get_ci(value, key) {
        None => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(ConfcomError::UserInput(format!(
            "field [\"{key}\"] can only be a boolean value"
        ))),
    }
}

fn optional_int(value: &Value, key: &str) -> Result<Option<i64>> {
    match get_ci(value, key) {
        None => Ok(None),
        Some(raw) => raw.as_i64().map(Some).ok_or_else(|| {
            ConfcomError::UserInput(format!("field [\"{key}\"] can only be an integer value"))
        }),
    }
}

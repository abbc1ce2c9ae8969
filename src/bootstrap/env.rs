//! The box owns its environment: everything inherited is dropped, then the
//! configured `KEY=VAL` pairs are planted.

use std::env;

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct EnvVar {
    pub name: String,
    pub val: String,
}

/// Splits each entry on the first `=`. Entries without a `=` or with an
/// empty name are silently skipped.
pub(crate) fn parse_env_vars(vars: &[String]) -> Vec<EnvVar> {
    vars.iter()
        .filter_map(|v| {
            let (name, val) = v.split_once('=')?;
            if name.is_empty() {
                return None;
            }
            Some(EnvVar {
                name: name.to_string(),
                val: val.to_string(),
            })
        })
        .collect()
}

/// Clears the whole process environment, then installs the parsed pairs.
pub fn plant_env(vars: &[String]) {
    let inherited: Vec<String> = env::vars().map(|(k, _)| k).collect();
    for key in inherited {
        env::remove_var(key);
    }
    for var in parse_env_vars(vars) {
        env::set_var(var.name, var.val);
    }
}

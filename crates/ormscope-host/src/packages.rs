//! Dependency packages an interpreter can be provisioned with.

use std::cmp::Ordering;

use crate::error::HostError;
use crate::value::{NativeFunction, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionOp {
    Exact,
    AtLeast,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub constraint: Option<(VersionOp, String)>,
}

impl Requirement {
    /// Parse one requirement line: `name`, `name==1.0` or `name>=1.0`.
    ///
    /// # Errors
    /// Returns [`HostError::Requirement`] for malformed names or versions.
    pub fn parse(line: &str) -> Result<Self, HostError> {
        let invalid = |reason: &str| HostError::Requirement {
            line: line.to_string(),
            reason: reason.to_string(),
        };

        let (name, constraint) = if let Some((name, version)) = line.split_once("==") {
            (name, Some((VersionOp::Exact, version.trim())))
        } else if let Some((name, version)) = line.split_once(">=") {
            (name, Some((VersionOp::AtLeast, version.trim())))
        } else {
            (line, None)
        };

        let name = name.trim().to_lowercase();
        if name.is_empty()
            || !name
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.')
        {
            return Err(invalid("expected a package name"));
        }
        let constraint = match constraint {
            Some((op, version)) => {
                if parse_version(version).is_none() {
                    return Err(invalid("expected a dotted numeric version"));
                }
                Some((op, version.to_string()))
            }
            None => None,
        };
        Ok(Self { name, constraint })
    }

    #[must_use]
    pub fn is_satisfied_by(&self, available: &str) -> bool {
        let Some((op, wanted)) = &self.constraint else {
            return true;
        };
        let (Some(have), Some(want)) = (parse_version(available), parse_version(wanted)) else {
            return false;
        };
        match op {
            VersionOp::Exact => compare_versions(&have, &want) == Ordering::Equal,
            VersionOp::AtLeast => compare_versions(&have, &want) != Ordering::Less,
        }
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.constraint {
            Some((VersionOp::Exact, version)) => write!(f, "{}=={version}", self.name),
            Some((VersionOp::AtLeast, version)) => write!(f, "{}>={version}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

fn parse_version(version: &str) -> Option<Vec<u64>> {
    version
        .split('.')
        .map(|part| part.parse::<u64>().ok())
        .collect()
}

fn compare_versions(lhs: &[u64], rhs: &[u64]) -> Ordering {
    let width = lhs.len().max(rhs.len());
    (0..width)
        .map(|index| {
            let a = lhs.get(index).copied().unwrap_or(0);
            let b = rhs.get(index).copied().unwrap_or(0);
            a.cmp(&b)
        })
        .find(|ordering| *ordering != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Parse a dependency list: one requirement per line or comma, `#` comments.
///
/// # Errors
/// Returns the first malformed requirement.
pub fn parse_requirements(text: &str) -> Result<Vec<Requirement>, HostError> {
    text.lines()
        .map(|line| line.split_once('#').map_or(line, |(head, _)| head))
        .flat_map(|line| line.split(','))
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(Requirement::parse)
        .collect()
}

/// Makes a requirement available to an interpreter.
pub trait PackageInstaller: Send + Sync {
    /// Resolve the requirement and return the functions it provides.
    #[allow(clippy::missing_errors_doc)]
    fn install(&self, requirement: &Requirement) -> Result<Vec<NativeFunction>, HostError>;
}

struct Package {
    name: &'static str,
    version: &'static str,
    functions: &'static [NativeFunction],
}

const TEXT_FUNCTIONS: &[NativeFunction] = &[
    NativeFunction {
        name: "upper",
        func: text_upper,
    },
    NativeFunction {
        name: "lower",
        func: text_lower,
    },
    NativeFunction {
        name: "strip",
        func: text_strip,
    },
    NativeFunction {
        name: "join",
        func: text_join,
    },
];

const MATH_FUNCTIONS: &[NativeFunction] = &[
    NativeFunction {
        name: "abs",
        func: math_abs,
    },
    NativeFunction {
        name: "min",
        func: math_min,
    },
    NativeFunction {
        name: "max",
        func: math_max,
    },
    NativeFunction {
        name: "round",
        func: math_round,
    },
];

const PACKAGES: &[Package] = &[
    Package {
        name: "text",
        version: "1.0.0",
        functions: TEXT_FUNCTIONS,
    },
    Package {
        name: "math",
        version: "1.2.0",
        functions: MATH_FUNCTIONS,
    },
    Package {
        name: "sqlite",
        version: "3.45.0",
        functions: &[],
    },
];

/// Installer backed by the packages compiled into the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinPackages;

impl BuiltinPackages {
    #[must_use]
    pub fn available() -> Vec<(&'static str, &'static str)> {
        PACKAGES
            .iter()
            .map(|package| (package.name, package.version))
            .collect()
    }
}

impl PackageInstaller for BuiltinPackages {
    fn install(&self, requirement: &Requirement) -> Result<Vec<NativeFunction>, HostError> {
        let package = PACKAGES
            .iter()
            .find(|package| package.name == requirement.name)
            .ok_or_else(|| HostError::UnknownPackage {
                name: requirement.name.clone(),
            })?;
        if !requirement.is_satisfied_by(package.version) {
            return Err(HostError::VersionMismatch {
                name: package.name.to_string(),
                available: package.version.to_string(),
                constraint: requirement.to_string(),
            });
        }
        tracing::debug!(package = package.name, version = package.version, "package installed");
        Ok(package.functions.to_vec())
    }
}

fn single_str<'a>(name: &str, args: &'a [Value]) -> Result<&'a str, String> {
    match args {
        [Value::Str(value)] => Ok(value),
        _ => Err(format!("{name}() expects one str argument")),
    }
}

fn text_upper(args: &[Value]) -> Result<Value, String> {
    single_str("upper", args).map(|value| Value::Str(value.to_uppercase()))
}

fn text_lower(args: &[Value]) -> Result<Value, String> {
    single_str("lower", args).map(|value| Value::Str(value.to_lowercase()))
}

fn text_strip(args: &[Value]) -> Result<Value, String> {
    single_str("strip", args).map(|value| Value::Str(value.trim().to_string()))
}

fn text_join(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Str(separator), Value::List(items)] => Ok(Value::Str(
            items
                .iter()
                .map(Value::display)
                .collect::<Vec<_>>()
                .join(separator),
        )),
        _ => Err("join() expects a separator and a list".to_string()),
    }
}

fn math_abs(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Int(value)] => value
            .checked_abs()
            .map(Value::Int)
            .ok_or_else(|| "integer overflow".to_string()),
        [Value::Float(value)] => Ok(Value::Float(value.abs())),
        _ => Err("abs() expects one number".to_string()),
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        #[allow(clippy::cast_precision_loss)]
        Value::Int(raw) => Some(*raw as f64),
        Value::Float(raw) => Some(*raw),
        _ => None,
    }
}

fn extreme(name: &str, args: &[Value], keep: Ordering) -> Result<Value, String> {
    let items: &[Value] = match args {
        [Value::List(items)] => items,
        _ => args,
    };
    let mut best: Option<(&Value, f64)> = None;
    for item in items {
        let number = as_number(item).ok_or_else(|| format!("{name}() expects numbers"))?;
        let replace = match best {
            None => true,
            Some((_, current)) => number.partial_cmp(&current) == Some(keep),
        };
        if replace {
            best = Some((item, number));
        }
    }
    best.map(|(value, _)| value.clone())
        .ok_or_else(|| format!("{name}() arg is an empty sequence"))
}

fn math_min(args: &[Value]) -> Result<Value, String> {
    extreme("min", args, Ordering::Less)
}

fn math_max(args: &[Value]) -> Result<Value, String> {
    extreme("max", args, Ordering::Greater)
}

fn math_round(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Int(value)] | [Value::Int(value), _] => Ok(Value::Int(*value)),
        [Value::Float(value)] => {
            #[allow(clippy::cast_possible_truncation)]
            let rounded = value.round() as i64;
            Ok(Value::Int(rounded))
        }
        [Value::Float(value), Value::Int(digits)] => {
            let digits = i32::try_from(*digits).map_err(|_| "ndigits out of range".to_string())?;
            let scale = 10f64.powi(digits);
            Ok(Value::Float((value * scale).round() / scale))
        }
        _ => Err("round() expects a number and optional ndigits".to_string()),
    }
}

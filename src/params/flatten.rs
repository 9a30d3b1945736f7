use super::{ParamValue, ThreadConfig};
use itertools::Itertools;

/// Renders a thread's parameters as command-line arguments.
///
/// `<prefix><name><separator><value>` per parameter, or two arguments when the
/// separator is a single space. Empty scalar values render as bare flags.
/// Parameters come out in name order.
pub fn flatten(params: &ThreadConfig, prefix: &str, separator: &str) -> Vec<String> {
    let mut args = Vec::with_capacity(params.len());
    for (name, value) in params {
        let value = match value {
            ParamValue::Components(components) => components.values().join(","),
            ParamValue::Scalar(v) if v.is_empty() => {
                args.push(format!("{}{}", prefix, name));
                continue;
            }
            ParamValue::Scalar(v) => v.clone(),
        };
        if separator == " " {
            args.push(format!("{}{}", prefix, name));
            args.push(value);
        } else {
            args.push(format!("{}{}{}{}", prefix, name, separator, value));
        }
    }
    args
}

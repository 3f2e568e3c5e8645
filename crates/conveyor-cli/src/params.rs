use anyhow::{bail, Result};
use conveyor_scheduler::JobParameters;

/// Parse `name=value` pairs from the command line. `value` is read as JSON
/// when it parses, otherwise kept as a plain string.
pub fn parse_all(raw: &[String]) -> Result<JobParameters> {
    let mut parameters = JobParameters::new();
    for pair in raw {
        let Some((name, value)) = pair.split_once('=') else {
            bail!("parameter '{pair}' must look like name=value");
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("parameter '{pair}' has an empty name");
        }
        let value = serde_json::from_str(value)
            .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
        parameters.insert(name, value);
    }
    Ok(parameters)
}

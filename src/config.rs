use std::time::Duration;

/// Prefix for every environment variable this daemon reads.
pub const ENV_PREFIX: &str = "VXR_";

/// Docker plugin name of the network driver.
pub const NETWORK_DRIVER_NAME: &str = "vxrnet";
/// Docker plugin name of the IPAM driver.
pub const IPAM_DRIVER_NAME: &str = "vxripam";

/// Kernel route protocol tagging routes owned by this daemon.
pub const DEFAULT_ROUTE_PROTO: u8 = 192;
/// Sleep between attempts when a specific address was requested.
pub const DEFAULT_REQ_ADDR_SLEEP: Duration = Duration::from_millis(100);
/// Timeout applied to every orchestrator RPC.
pub const DOCKER_TIMEOUT: Duration = Duration::from_secs(5);
/// Drain window for in-flight plugin requests on shutdown.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Runtime configuration resolved from CLI flags and `VXR_*` environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Scope reported to the orchestrator, `local` or `global`.
    pub scope: String,
    /// Estimated cluster-wide route propagation delay.
    pub prop_timeout: Duration,
    /// Overall deadline for one address request.
    pub resp_timeout: Duration,
    /// Interval between reconciler sweeps, zero disables the ticker.
    pub reconcile_interval: Duration,
    pub route_proto: u8,
    pub req_addr_sleep: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scope: "local".to_string(),
            prop_timeout: Duration::from_millis(100),
            resp_timeout: Duration::from_secs(10),
            reconcile_interval: Duration::from_secs(30),
            route_proto: DEFAULT_ROUTE_PROTO,
            req_addr_sleep: DEFAULT_REQ_ADDR_SLEEP,
        }
    }
}

impl Config {
    /// Fill in the settings that are environment-only (not CLI flags).
    pub fn with_env(mut self) -> Self {
        self.route_proto =
            env_int_with_default(&format!("{}ROUTE_PROTO", ENV_PREFIX), None, DEFAULT_ROUTE_PROTO);
        self.req_addr_sleep = env_dur_with_default(
            &format!("{}REQ_ADDR_SLEEP", ENV_PREFIX),
            None,
            DEFAULT_REQ_ADDR_SLEEP,
        );
        self
    }
}

fn env_opt(var: &str, opt: Option<&str>) -> Option<String> {
    match opt {
        Some(v) if !v.is_empty() => Some(v.to_string()),
        _ => std::env::var(var).ok().filter(|v| !v.is_empty()),
    }
}

/// Resolve an integer setting, preferring the per-network option over the
/// environment variable over the default.
pub fn env_int_with_default<T>(var: &str, opt: Option<&str>, def: T) -> T
where
    T: std::str::FromStr + Copy,
{
    let Some(raw) = env_opt(var, opt) else {
        return def;
    };
    match raw.parse() {
        Ok(v) => v,
        Err(_) => {
            tracing::warn!(value = %raw, var, "failed to parse integer, using default");
            def
        }
    }
}

/// Resolve a duration setting (humantime syntax, e.g. `100ms`, `10s`).
pub fn env_dur_with_default(var: &str, opt: Option<&str>, def: Duration) -> Duration {
    let Some(raw) = env_opt(var, opt) else {
        return def;
    };
    match humantime::parse_duration(&raw) {
        Ok(v) => v,
        Err(err) => {
            tracing::warn!(value = %raw, var, %err, "failed to parse duration, using default");
            def
        }
    }
}

/// Resolve a boolean setting. Accepts `true`/`false`/`1`/`0`.
pub fn env_bool_with_default(var: &str, opt: Option<&str>, def: bool) -> bool {
    let Some(raw) = env_opt(var, opt) else {
        return def;
    };
    match raw.as_str() {
        "1" => true,
        "0" => false,
        other => match other.parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(value = %raw, var, "failed to parse bool, using default");
                def
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_takes_precedence_over_env() {
        std::env::set_var("VXR_TEST_PRECEDENCE", "5");
        assert_eq!(env_int_with_default("VXR_TEST_PRECEDENCE", Some("7"), 1), 7);
        assert_eq!(env_int_with_default("VXR_TEST_PRECEDENCE", None, 1), 5);
        std::env::remove_var("VXR_TEST_PRECEDENCE");
        assert_eq!(env_int_with_default("VXR_TEST_PRECEDENCE", None, 1), 1);
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(
            env_dur_with_default("VXR_TEST_NOPE", Some("250ms"), Duration::ZERO),
            Duration::from_millis(250)
        );
        assert_eq!(
            env_dur_with_default("VXR_TEST_NOPE", Some("garbage"), Duration::from_secs(2)),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn bool_parsing() {
        assert!(env_bool_with_default("VXR_TEST_NOPE", Some("1"), false));
        assert!(env_bool_with_default("VXR_TEST_NOPE", Some("true"), false));
        assert!(!env_bool_with_default("VXR_TEST_NOPE", Some("0"), true));
    }
}

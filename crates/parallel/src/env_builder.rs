use parallel_core::env::{
    PARALLEL_BINARY_MD5_VAR, PARALLEL_HEARTBEAT_INTERVAL_MS_VAR, PARALLEL_HEARTBEAT_TIMEOUT_MS_VAR,
    PARALLEL_PARENT_ADDR_VAR, PARALLEL_PARENT_COOKIE_VAR, PARALLEL_ROLE_VAR, RESERVED_VARS,
};
use parallel_core::{ParallelError, WorkerAddress, WorkerId};

use crate::heartbeat::HeartbeatPolicy;

/// Inputs needed to compute the environment block a spawned child inherits.
pub struct ChildEnvSpec<'a> {
    pub worker_id: &'a WorkerId,
    pub parent_addr: &'a WorkerAddress,
    pub cookie: &'a str,
    pub binary_md5_hex: &'a str,
    pub heartbeat_policy: &'a HeartbeatPolicy,
    pub extra: &'a [(String, String)],
}

/// Pure function: given the spawn inputs, returns the environment pairs a
/// spawned child inherits. No I/O, no process interaction — the Spawn
/// Engine applies the result to a `Command` or a remote-shell invocation.
pub fn build_child_env(spec: &ChildEnvSpec<'_>) -> Result<Vec<(String, String)>, ParallelError> {
    for (key, _) in spec.extra {
        if RESERVED_VARS.contains(&key.as_str()) {
            return Err(ParallelError::ReservedEnvKey(key.clone()));
        }
    }

    let mut pairs = vec![
        (PARALLEL_ROLE_VAR.to_string(), spec.worker_id.0.clone()),
        (
            PARALLEL_PARENT_ADDR_VAR.to_string(),
            spec.parent_addr.to_string(),
        ),
        (
            PARALLEL_PARENT_COOKIE_VAR.to_string(),
            spec.cookie.to_string(),
        ),
        (
            PARALLEL_BINARY_MD5_VAR.to_string(),
            spec.binary_md5_hex.to_string(),
        ),
    ];

    if let HeartbeatPolicy::ConnectAndShutdownOnDisconnect { interval, timeout } =
        spec.heartbeat_policy
    {
        pairs.push((
            PARALLEL_HEARTBEAT_INTERVAL_MS_VAR.to_string(),
            interval.as_millis().to_string(),
        ));
        pairs.push((
            PARALLEL_HEARTBEAT_TIMEOUT_MS_VAR.to_string(),
            timeout.as_millis().to_string(),
        ));
    }

    pairs.extend(spec.extra.iter().cloned());
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn spec<'a>(
        worker_id: &'a WorkerId,
        addr: &'a WorkerAddress,
        extra: &'a [(String, String)],
    ) -> ChildEnvSpec<'a> {
        ChildEnvSpec {
            worker_id,
            parent_addr: addr,
            cookie: "cookie-1",
            binary_md5_hex: "deadbeef",
            heartbeat_policy: &HeartbeatPolicy::Optional,
            extra,
        }
    }

    #[test]
    fn sets_reserved_keys() {
        let id = WorkerId("worker-0".to_string());
        let addr = WorkerAddress::new("127.0.0.1", 4000);
        let extra = [];
        let pairs = build_child_env(&spec(&id, &addr, &extra)).unwrap();
        let map: std::collections::HashMap<_, _> = pairs.into_iter().collect();
        assert_eq!(map[PARALLEL_ROLE_VAR], "worker-0");
        assert_eq!(map[PARALLEL_PARENT_ADDR_VAR], "127.0.0.1:4000");
        assert_eq!(map[PARALLEL_PARENT_COOKIE_VAR], "cookie-1");
    }

    #[test]
    fn rejects_extra_overriding_reserved_key() {
        let id = WorkerId("worker-0".to_string());
        let addr = WorkerAddress::new("127.0.0.1", 4000);
        let extra = [(PARALLEL_ROLE_VAR.to_string(), "evil".to_string())];
        let err = build_child_env(&spec(&id, &addr, &extra)).unwrap_err();
        assert!(matches!(err, ParallelError::ReservedEnvKey(_)));
    }

    #[test]
    fn propagates_heartbeat_policy_when_enabled() {
        let id = WorkerId("worker-0".to_string());
        let addr = WorkerAddress::new("127.0.0.1", 4000);
        let extra = [];
        let mut s = spec(&id, &addr, &extra);
        let policy = HeartbeatPolicy::ConnectAndShutdownOnDisconnect {
            interval: Duration::from_millis(100),
            timeout: Duration::from_millis(500),
        };
        s.heartbeat_policy = &policy;
        let pairs = build_child_env(&s).unwrap();
        let map: std::collections::HashMap<_, _> = pairs.into_iter().collect();
        assert_eq!(map[PARALLEL_HEARTBEAT_INTERVAL_MS_VAR], "100");
        assert_eq!(map[PARALLEL_HEARTBEAT_TIMEOUT_MS_VAR], "500");
    }
}

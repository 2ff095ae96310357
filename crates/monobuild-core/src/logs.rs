//! Log object key template.
//!
//! Every task's build output lands at `logs/<job_id>/<task_id>.log`. The
//! sidecar writes it, the coordinator records it, the garbage collector is
//! the only deleter.

/// Prefix under which all task logs live.
pub const LOG_PREFIX: &str = "logs/";

/// Deterministic log object key for a task.
pub fn log_file_key(job_id: i32, task_id: i32) -> String {
    format!("logs/{}/{}.log", job_id, task_id)
}

/// Parse `(job_id, task_id)` out of a log object key. Returns `None` for
/// keys that do not match the template.
pub fn parse_log_file_key(key: &str) -> Option<(i32, i32)> {
    let rest = key.strip_prefix(LOG_PREFIX)?;
    let (job, task) = rest.split_once('/')?;
    let task = task.strip_suffix(".log")?;
    if task.contains('/') {
        return None;
    }
    Some((job.parse().ok()?, task.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let key = log_file_key(3, 14);
        assert_eq!(key, "logs/3/14.log");
        assert_eq!(parse_log_file_key(&key), Some((3, 14)));
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        assert_eq!(parse_log_file_key("manifest_1.json"), None);
        assert_eq!(parse_log_file_key("logs/a/b.log"), None);
        assert_eq!(parse_log_file_key("logs/1/2/3.log"), None);
        assert_eq!(parse_log_file_key("logs/1/2.txt"), None);
    }
}

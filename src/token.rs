use {
    rand::{distributions::Alphanumeric, thread_rng, Rng},
    std::sync::atomic::{AtomicU64, Ordering},
};

const RANDOM_SUFFIX_LEN: usize = 12;

///
/// Hands out owner tokens for new lock handles.
///
/// Tokens must not collide across handles, whether they live in the same process or not.
///
pub trait TokenSource: Send + Sync {
    fn next_token(&self) -> String;
}

///
/// Default token source: `<pid>-<counter>-<random>`.
///
/// The pid separates processes on one host, the counter separates handles within a process
/// and the random suffix separates hosts (and recycled pids).
///
#[derive(Debug)]
pub struct ProcessTokenSource {
    pid: u32,
    counter: AtomicU64,
}

impl ProcessTokenSource {
    pub fn new() -> Self {
        Self {
            pid: std::process::id(),
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for ProcessTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenSource for ProcessTokenSource {
    fn next_token(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let suffix: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(RANDOM_SUFFIX_LEN)
            .map(char::from)
            .collect();
        format!("{:x}-{seq:x}-{suffix}", self.pid)
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::collections::HashSet};

    #[test]
    fn process_tokens_are_unique() {
        let source = ProcessTokenSource::new();
        let tokens: HashSet<String> = (0..1000).map(|_| source.next_token()).collect();
        assert_eq!(tokens.len(), 1000);
    }

    #[test]
    fn process_tokens_start_with_pid() {
        let source = ProcessTokenSource::new();
        let token = source.next_token();
        assert!(token.starts_with(&format!("{:x}-0-", std::process::id())));
    }
}

/// Bounded attempt budget for a fallible step. Attempts run back to back;
/// the last error is returned once the budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn run<T, E>(&self, mut attempt_fn: impl FnMut(u32) -> Result<T, E>) -> Result<T, E> {
        let budget = self.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=budget {
            match attempt_fn(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => last_error = Some(err),
            }
        }
        Err(last_error.expect("at least one attempt ran"))
    }
}

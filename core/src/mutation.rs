use crate::cache::QueryCache;
use crate::error::LiftError;
use crate::key::QueryKey;
use crate::retry::{run_with_retry, RetryPolicy};
use std::future::Future;

type SuccessHook<R> = Box<dyn FnOnce(&R, &QueryCache) + Send>;

/// How a one-shot mutation should be executed.
pub struct MutationOptions<R> {
    pub label: &'static str,
    pub retry: u32,
    pub invalidates: Vec<QueryKey>,
    on_success: Option<SuccessHook<R>>,
}

impl<R> MutationOptions<R> {
    pub fn new(label: &'static str, retry: u32) -> Self {
        Self {
            label,
            retry,
            invalidates: Vec::new(),
            on_success: None,
        }
    }

    /// Side-effecting calls that must never be sent twice.
    pub fn no_retry(mut self) -> Self {
        self.retry = 0;
        self
    }

    pub fn invalidates(mut self, keys: impl IntoIterator<Item = QueryKey>) -> Self {
        self.invalidates.extend(keys);
        self
    }

    pub fn on_success(mut self, hook: impl FnOnce(&R, &QueryCache) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(hook));
        self
    }
}

impl QueryCache {
    pub fn mutation_options<R>(&self, label: &'static str) -> MutationOptions<R> {
        MutationOptions::new(label, self.defaults().mutation_retry)
    }

    /// Run a mutation, retrying only network failures, then apply its
    /// success hook and invalidations.
    pub async fn mutate<I, R, F, Fut>(
        &self,
        mut mutation_fn: F,
        input: I,
        options: MutationOptions<R>,
    ) -> Result<R, LiftError>
    where
        I: Clone,
        F: FnMut(I) -> Fut,
        Fut: Future<Output = Result<R, LiftError>>,
    {
        let MutationOptions {
            label,
            retry,
            invalidates,
            on_success,
        } = options;
        let result = run_with_retry(RetryPolicy::mutation(retry), label, || {
            mutation_fn(input.clone())
        })
        .await?;
        if let Some(hook) = on_success {
            hook(&result, self);
        }
        if !invalidates.is_empty() {
            self.invalidate(&invalidates);
        }
        tracing::debug!(mutation = label, "mutation succeeded");
        Ok(result)
    }
}

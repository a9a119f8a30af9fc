//! Forward, backward and abort traversal of an interceptor chain.
//!
//! The request pass records how many positions it entered in
//! [`Exchange::chain_end`]; both backward passes only ever walk that prefix,
//! in reverse.

use std::{any::Any, panic::AssertUnwindSafe};

use futures_util::FutureExt;

use crate::core::{
    exchange::{Exchange, ExchangeFault},
    interceptor::{Flow, InterceptorResult, Outcome, SharedInterceptor},
};

pub struct FlowController;

impl FlowController {
    /// Runs request handlers from the start of the chain.
    ///
    /// `Return` runs the response pass and `Abort` (or a failing handler) runs
    /// the abort pass before this returns, so the caller only has to act on
    /// `Continue`.
    pub async fn invoke_request_handlers(
        exchange: &mut Exchange,
        chain: &[SharedInterceptor],
    ) -> Outcome {
        for (i, interceptor) in chain.iter().enumerate() {
            exchange.set_chain_end(i + 1);
            if !interceptor.flow().contains(Flow::REQUEST) {
                continue;
            }

            let result = AssertUnwindSafe(interceptor.handle_request(exchange))
                .catch_unwind()
                .await;
            match settle(interceptor.name(), result) {
                Ok(Outcome::Continue) => {}
                Ok(Outcome::Return) => {
                    tracing::debug!("Interceptor {} returned early", interceptor.name());
                    return match Self::invoke_response_handlers(exchange, chain).await {
                        Outcome::Abort => Outcome::Abort,
                        _ => Outcome::Return,
                    };
                }
                Ok(Outcome::Abort) => {
                    tracing::debug!("Interceptor {} aborted the request", interceptor.name());
                    Self::invoke_abort_handlers(exchange, chain, i + 1).await;
                    return Outcome::Abort;
                }
                Err(fault) => {
                    tracing::warn!("{}", fault);
                    exchange.set_fault(fault);
                    Self::invoke_abort_handlers(exchange, chain, i + 1).await;
                    return Outcome::Abort;
                }
            }
        }
        Outcome::Continue
    }

    /// Runs response handlers over the visited prefix in reverse.
    ///
    /// `Return` counts as `Continue` here. An abort or failure at position `j`
    /// runs the abort pass over `[0, j)` and yields `Abort`.
    pub async fn invoke_response_handlers(
        exchange: &mut Exchange,
        chain: &[SharedInterceptor],
    ) -> Outcome {
        let end = exchange.chain_end().min(chain.len());
        for j in (0..end).rev() {
            let interceptor = &chain[j];
            if !interceptor.flow().contains(Flow::RESPONSE) {
                continue;
            }

            let result = AssertUnwindSafe(interceptor.handle_response(exchange))
                .catch_unwind()
                .await;
            match settle(interceptor.name(), result) {
                Ok(Outcome::Continue | Outcome::Return) => {}
                Ok(Outcome::Abort) => {
                    tracing::debug!(
                        "Interceptor {} aborted during the response pass",
                        interceptor.name()
                    );
                    Self::invoke_abort_handlers(exchange, chain, j).await;
                    return Outcome::Abort;
                }
                Err(fault) => {
                    tracing::warn!("{}", fault);
                    exchange.set_fault(fault);
                    Self::invoke_abort_handlers(exchange, chain, j).await;
                    return Outcome::Abort;
                }
            }
        }
        Outcome::Continue
    }

    /// Notifies `[0, end)` in reverse. Failures are logged and never stop the
    /// pass.
    pub async fn invoke_abort_handlers(
        exchange: &mut Exchange,
        chain: &[SharedInterceptor],
        end: usize,
    ) {
        for interceptor in chain[..end.min(chain.len())].iter().rev() {
            if !interceptor.flow().contains(Flow::ABORT) {
                continue;
            }

            let result = AssertUnwindSafe(interceptor.handle_abort(exchange))
                .catch_unwind()
                .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(
                        "Abort handler of interceptor {} failed: {}",
                        interceptor.name(),
                        e
                    );
                }
                Err(panic) => {
                    tracing::warn!(
                        "Abort handler of interceptor {} panicked: {}",
                        interceptor.name(),
                        panic_message(panic.as_ref())
                    );
                }
            }
        }
    }
}

/// Folds handler errors and panics into an interceptor fault.
fn settle(
    name: &str,
    result: Result<InterceptorResult<Outcome>, Box<dyn Any + Send>>,
) -> Result<Outcome, ExchangeFault> {
    match result {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(ExchangeFault::Interceptor {
            interceptor: name.to_string(),
            message: e.to_string(),
        }),
        Err(panic) => Err(ExchangeFault::Interceptor {
            interceptor: name.to_string(),
            message: format!("panicked: {}", panic_message(panic.as_ref())),
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

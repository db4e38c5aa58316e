// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Mutex;

use tracing::warn;

use crate::{Callback, HookError, RunContext, TurnOutput};

/// Accumulates `response_cost` per turn and trips once the run exceeds the
/// configured ceiling.  The trip surfaces as [`HookError::Budget`], which
/// the orchestrator turns into a clean `completed` termination with a
/// terminal message naming the budget – never a failure.
pub struct BudgetCap {
    max_usd: f64,
    spent: Mutex<f64>,
}

impl BudgetCap {
    pub fn new(max_usd: f64) -> Self {
        Self { max_usd, spent: Mutex::new(0.0) }
    }

    pub fn spent(&self) -> f64 {
        *self.spent.lock().unwrap()
    }
}

impl Callback for BudgetCap {
    fn name(&self) -> &str {
        "budget_cap"
    }

    fn after_llm(&self, ctx: &RunContext, output: TurnOutput) -> Result<TurnOutput, HookError> {
        let mut spent = self.spent.lock().unwrap();
        *spent += output.usage.response_cost;
        if *spent > self.max_usd {
            warn!(
                run_id = %ctx.run_id,
                spent = *spent,
                max = self.max_usd,
                "trajectory budget exceeded",
            );
            return Err(HookError::Budget(format!(
                "trajectory budget of ${:.4} exceeded (spent ${:.4})",
                self.max_usd, *spent
            )));
        }
        Ok(output)
    }
}

// File: eval.rs
// SPDX-License-Identifier: MIT OR Apache-2.0
//
// Copyright (c) 2023-2025
// - Volker Schwaberow <volker@schwaberow.de>

use crate::error::RaceError;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

static EVAL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<<<(.*?)>>>").unwrap());

// Per-worker evaluation context for <<<expr>>> markers. The expression
// language is a closed set, not a general interpreter: field references and
// a couple of generator functions.
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub thread_num: usize,
    counter: u64,
}

impl EvalContext {
    pub fn new(thread_num: usize) -> Self {
        Self {
            thread_num,
            counter: 0,
        }
    }

    // Replaces every <<<expr>>> occurrence in `input`. Text without markers
    // passes through byte-identical.
    pub fn expand(&mut self, input: &str) -> Result<String, RaceError> {
        if !input.contains("<<<") {
            return Ok(input.to_string());
        }

        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in EVAL_PATTERN.captures_iter(input) {
            let whole = caps.get(0).unwrap();
            let expr = caps.get(1).unwrap().as_str();
            out.push_str(&input[last..whole.start()]);
            out.push_str(&self.eval(expr)?);
            last = whole.end();
        }
        out.push_str(&input[last..]);
        Ok(out)
    }

    fn eval(&mut self, expr: &str) -> Result<String, RaceError> {
        let expr = expr.trim();

        match expr {
            "self.thread_num" => return Ok(self.thread_num.to_string()),
            "random()" => {
                let value: f64 = rand::thread_rng().gen();
                return Ok(value.to_string());
            }
            "counter()" => {
                let value = self.counter;
                self.counter += 1;
                return Ok(value.to_string());
            }
            _ => {}
        }

        if let Some(args) = call_args(expr, "randint") {
            let (lo, hi) = parse_int_pair(&args).ok_or_else(|| RaceError::Callback {
                reason: format!("randint expects two integers, got '{}'", args),
            })?;
            if lo > hi {
                return Err(RaceError::Callback {
                    reason: format!("randint bounds out of order: {} > {}", lo, hi),
                });
            }
            let value: i64 = rand::thread_rng().gen_range(lo..=hi);
            return Ok(value.to_string());
        }

        Err(RaceError::Callback {
            reason: format!("unsupported expression: '{}'", expr),
        })
    }
}

fn call_args(expr: &str, name: &str) -> Option<String> {
    let rest = expr.strip_prefix(name)?.trim_start();
    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
    Some(inner.to_string())
}

fn parse_int_pair(args: &str) -> Option<(i64, i64)> {
    let (a, b) = args.split_once(',')?;
    Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
}

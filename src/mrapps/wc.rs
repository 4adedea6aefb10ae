use std::sync::Arc;

use anyhow::Context as _;

use crate::mr::{AppFuture, KeyValue, MRApp, MapInput, Params};

/// Word count over whitespace separated tokens.
///
/// Params: `lowercase=true` folds case before counting.
pub struct WC;

/// Word count over runs of alphabetic characters, punctuation dropped.
pub struct Words;

fn lowercase(params: &Params) -> bool {
    params.get("lowercase").is_some_and(|v| v == "true")
}

fn emit(res: &mut Vec<KeyValue>, word: &str, fold: bool) {
    let key = if fold { word.to_lowercase() } else { word.to_string() };
    res.push(KeyValue { key, value: "1".to_string() });
}

/// Values are partial counts; the result is their sum.
fn sum_counts(key: String, values: Vec<String>) -> AppFuture<Vec<KeyValue>> {
    Box::pin(async move {
        let mut total: u64 = 0;
        for v in &values {
            total += v
                .parse::<u64>()
                .with_context(|| format!("count {:?} for key {:?} is not a number", v, key))?;
        }
        Ok(vec![KeyValue { key, value: total.to_string() }])
    })
}

impl MRApp for WC {
    fn map(&self, input: MapInput, params: Arc<Params>) -> AppFuture<Vec<KeyValue>> {
        Box::pin(async move {
            let fold = lowercase(&params);
            let mut res = vec![];
            for (_, text) in input.contents().await? {
                for word in text.split_whitespace() {
                    emit(&mut res, word, fold);
                }
            }
            Ok(res)
        })
    }

    fn reduce(&self, key: String, values: Vec<String>, _params: Arc<Params>) -> AppFuture<Vec<KeyValue>> {
        sum_counts(key, values)
    }
}

impl MRApp for Words {
    fn map(&self, input: MapInput, params: Arc<Params>) -> AppFuture<Vec<KeyValue>> {
        Box::pin(async move {
            let fold = lowercase(&params);
            let mut res = vec![];
            for (_, text) in input.contents().await? {
                let mut buf = String::new();
                for c in text.chars() {
                    if c.is_alphabetic() {
                        buf.push(c);
                    } else if !buf.is_empty() {
                        emit(&mut res, &buf, fold);
                        buf.clear();
                    }
                }
                if !buf.is_empty() {
                    emit(&mut res, &buf, fold);
                }
            }
            Ok(res)
        })
    }

    fn reduce(&self, key: String, values: Vec<String>, _params: Arc<Params>) -> AppFuture<Vec<KeyValue>> {
        sum_counts(key, values)
    }
}

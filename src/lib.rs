pub mod mr;
pub mod mrapps;
pub mod mrrt;
pub mod storage;

#[cfg(test)]
mod test_mr;

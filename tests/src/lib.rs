//! Scenario tests that drive `liftsync-core` through its public surface.

#[cfg(test)]
mod unit;

//! Reducers fold one column of a result table into a single value.
//!
//! A reducer must be associative and commutative so every member gets the
//! same answer. The fold itself always walks rows in ascending member order,
//! which keeps floating point results bit-identical across members too.

/// Combines two published values into one.
pub trait Reducer {
    fn combine(&self, acc: f64, next: f64) -> f64;
}

/// The built-in reductions. Counting is [`ReduceOp::Sum`] over contributed
/// `1.0`s; an average is a sum column divided by a count column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReduceOp {
    /// Aggregate rates are additive, so this is the default.
    #[default]
    Sum,
    Min,
    Max,
    Product,
}

impl Reducer for ReduceOp {
    fn combine(&self, acc: f64, next: f64) -> f64 {
        match self {
            ReduceOp::Sum => acc + next,
            ReduceOp::Product => acc * next,
            // f64::min/max drop NaN, a NaN contribution must survive the fold
            ReduceOp::Min => {
                if acc.is_nan() || next.is_nan() {
                    f64::NAN
                } else {
                    acc.min(next)
                }
            }
            ReduceOp::Max => {
                if acc.is_nan() || next.is_nan() {
                    f64::NAN
                } else {
                    acc.max(next)
                }
            }
        }
    }
}

impl<F> Reducer for F
where
    F: Fn(f64, f64) -> f64,
{
    fn combine(&self, acc: f64, next: f64) -> f64 {
        self(acc, next)
    }
}

/// Describes one column of a round: this member's contribution and how the
/// column is reduced.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Column {
    pub value: f64,
    pub op: ReduceOp,
}

impl Column {
    pub fn new(value: f64, op: ReduceOp) -> Self {
        Self { value, op }
    }

    pub fn sum(value: f64) -> Self {
        Self::new(value, ReduceOp::Sum)
    }

    /// A column that counts contributing members.
    pub fn count() -> Self {
        Self::new(1.0, ReduceOp::Sum)
    }
}

/// Folds `values` left to right, seeded with the first value. Returns `None`
/// for an empty column.
pub fn fold<R, I>(reducer: &R, values: I) -> Option<f64>
where
    R: Reducer + ?Sized,
    I: IntoIterator<Item = f64>,
{
    let mut values = values.into_iter();
    let first = values.next()?;
    Some(values.fold(first, |acc, next| reducer.combine(acc, next)))
}

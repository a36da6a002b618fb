#[macro_use]
extern crate log;

pub mod dist;
pub mod error;
pub mod rng;
pub mod series;
pub mod stats;

/// Shorthand macro to return a new [`TypedError`](crate::error::TypedError)
///
/// Allows expressing
///
/// ```no_run
/// # use anyhow::anyhow;
/// # use vqsim_core::error::{TypedError, TypedResult, SystemError};
/// # fn main() -> TypedResult<()>{
/// let extra_info = "problem";
/// let problem = anyhow!("a {extra_info} description");
/// return Err(TypedError::new(SystemError::Parameter, problem));
/// # }
/// ```
///
/// as a more compact
///
/// ```no_run
/// # use vqsim_core::error::TypedResult;
/// # use vqsim_core::problem;
/// # fn main() -> TypedResult<()>{
/// # let extra_info = "problem";
/// problem!(Parameter, "a {extra_info} description");
/// # }
/// ```
#[macro_export]
macro_rules! problem {
    ($typed_err: expr, $($tail:tt)*) => {{
        #[allow(unused_imports)]
        use $crate::error::SystemError::*;
        let problem = ::anyhow::anyhow!($($tail)*);
        return $crate::error::TypedResult::Err(
            $crate::error::TypedError::new($typed_err, problem)
        );
    }};
}

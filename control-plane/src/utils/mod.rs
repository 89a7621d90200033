pub mod duration;
pub mod generate;
pub mod password;
pub mod validation;

pub use duration::{format_duration, parse_duration, ApiDuration};
pub use password::{
    hash_password, hash_secret, hash_secret_blocking, verify_password, verify_secret,
    verify_secret_blocking, Password, PasswordPolicy,
};
pub use validation::Rules;

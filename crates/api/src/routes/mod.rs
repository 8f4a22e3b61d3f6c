pub mod health;
pub mod payjoin;
pub mod signing;

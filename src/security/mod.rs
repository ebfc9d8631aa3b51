pub mod jwt;
pub mod pairing;

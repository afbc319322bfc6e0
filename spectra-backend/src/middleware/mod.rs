pub mod control_auth;

pub mod bootstrap;
pub mod budget;
pub mod dispatch;
pub mod monitor;
pub mod notify;
pub mod process;
pub mod service;
pub mod tracker;
pub mod validator;

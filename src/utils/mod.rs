//! Utils: 日志和输入校验等通用工具

pub mod logger;
pub mod validator;

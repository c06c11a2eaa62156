//! 代理池统一错误类型

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("文件读写失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 序列化失败: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML 解析失败: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("配置无效: {0}")]
    InvalidConfig(String),

    /// 完整获取周期之后仍没有可用代理
    #[error("没有可用代理，且未允许直连回退")]
    Exhausted,
}

pub type PoolResult<T = ()> = std::result::Result<T, PoolError>;

use anyhow::Result;
use url::Url;

use crate::config::Config;

/// 可以交给后端的URI：能被解析且带有主机或是 magnet 链接
pub fn is_valid_uri(uri: &str) -> bool {
    match Url::parse(uri) {
        Ok(url) => url.scheme() == "magnet" || url.host_str().is_some(),
        Err(_) => false,
    }
}

/// 从URI路径中取出文件名，忽略查询参数和片段
pub fn name_from_uri(uri: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    if url.scheme() == "magnet" {
        return url
            .query_pairs()
            .find(|(k, _)| k == "dn")
            .map(|(_, v)| v.into_owned());
    }
    let last = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let decoded = String::from_utf8_lossy(&urlencoding::decode_binary(last.as_bytes())).into_owned();
    if decoded.is_empty() {
        None
    } else {
        Some(decoded)
    }
}

/// 小写的扩展名，不含点
pub fn file_ext_from_uri(uri: &str) -> Option<String> {
    let name = name_from_uri(uri)?;
    let (_, ext) = name.rsplit_once('.')?;
    if ext.is_empty() {
        None
    } else {
        Some(ext.to_ascii_lowercase())
    }
}

pub fn validate_uris(uris: &[String]) -> Result<()> {
    if let Some(bad) = uris.iter().find(|u| !is_valid_uri(u)) {
        anyhow::bail!("无效的URI: {}", bad);
    }
    Ok(())
}

pub fn validate_config(config: &Config) -> Result<()> {
    config.validate().map_err(anyhow::Error::from)
}

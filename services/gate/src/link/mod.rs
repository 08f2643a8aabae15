//! 链接相关：载荷加解密、签名 token、确认 token 以及签发/解析流程。

pub(crate) mod cipher;
pub(crate) mod issue;
pub(crate) mod payload;
pub(crate) mod resolve;
pub(crate) mod temp;
pub(crate) mod token;

//! 二进制方言：16 位操作码组成的记号流

use byteorder::{ByteOrder, LittleEndian};

use super::{XChild, XObject, HEADER_SIZE};
use crate::pmx::text::decode_shift_jis;
use crate::{MmdError, Result};

pub(crate) const TOKEN_NAME: u16 = 1;
pub(crate) const TOKEN_STRING: u16 = 2;
pub(crate) const TOKEN_INTEGER: u16 = 3;
pub(crate) const TOKEN_GUID: u16 = 5;
pub(crate) const TOKEN_INTEGER_LIST: u16 = 6;
pub(crate) const TOKEN_FLOAT_LIST: u16 = 7;
pub(crate) const TOKEN_OBRACE: u16 = 10;
pub(crate) const TOKEN_CBRACE: u16 = 11;
pub(crate) const TOKEN_COMMA: u16 = 19;
pub(crate) const TOKEN_SEMICOLON: u16 = 20;
pub(crate) const TOKEN_TEMPLATE: u16 = 31;

struct TokenReader<'a> {
    data: &'a [u8],
    pos: usize,
    float_size: usize,
}

impl<'a> TokenReader<'a> {
    fn eof(what: &str) -> MmdError {
        MmdError::ParseFailed(format!("x binary: unexpected end in {}", what))
    }

    fn bytes(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| Self::eof(what))?;
        let slice = self.data.get(self.pos..end).ok_or_else(|| Self::eof(what))?;
        self.pos = end;
        Ok(slice)
    }

    fn peek_token(&self) -> Option<u16> {
        self.data
            .get(self.pos..self.pos + 2)
            .map(LittleEndian::read_u16)
    }

    fn token(&mut self) -> Option<u16> {
        let token = self.peek_token()?;
        self.pos += 2;
        Some(token)
    }

    fn dword(&mut self, what: &str) -> Result<u32> {
        Ok(LittleEndian::read_u32(self.bytes(4, what)?))
    }

    fn float(&mut self, what: &str) -> Result<f64> {
        if self.float_size == 4 {
            Ok(LittleEndian::read_f32(self.bytes(4, what)?) as f64)
        } else {
            Ok(LittleEndian::read_f64(self.bytes(8, what)?))
        }
    }

    /// 已读入 NAME / STRING 记号后读取长度和内容
    fn text(&mut self, what: &str) -> Result<String> {
        let len = self.dword(what)? as usize;
        Ok(decode_shift_jis(self.bytes(len, what)?))
    }

    fn expect(&mut self, token: u16, what: &str) -> Result<()> {
        match self.token() {
            Some(t) if t == token => Ok(()),
            Some(t) => Err(MmdError::ParseFailed(format!(
                "x binary: expected token {} in {}, got {}",
                token, what, t
            ))),
            None => Err(Self::eof(what)),
        }
    }

    fn name(&mut self, what: &str) -> Result<String> {
        self.expect(TOKEN_NAME, what)?;
        self.text(what)
    }

    /// 跳过记号附带的数据
    fn skip_payload(&mut self, token: u16, what: &str) -> Result<()> {
        match token {
            TOKEN_NAME | TOKEN_STRING => {
                let len = self.dword(what)? as usize;
                self.bytes(len, what)?;
            }
            TOKEN_INTEGER => {
                self.bytes(4, what)?;
            }
            TOKEN_GUID => {
                self.bytes(16, what)?;
            }
            TOKEN_INTEGER_LIST => {
                let n = self.dword(what)? as usize;
                self.bytes(n.saturating_mul(4), what)?;
            }
            TOKEN_FLOAT_LIST => {
                let n = self.dword(what)? as usize;
                self.bytes(n.saturating_mul(self.float_size), what)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn skip_template(&mut self) -> Result<()> {
        self.name("template")?;
        self.expect(TOKEN_OBRACE, "template")?;
        let mut depth = 1;
        while depth > 0 {
            let token = self.token().ok_or_else(|| Self::eof("template"))?;
            match token {
                TOKEN_OBRACE => depth += 1,
                TOKEN_CBRACE => depth -= 1,
                other => self.skip_payload(other, "template")?,
            }
        }
        Ok(())
    }

    fn parse_file(&mut self) -> Result<Vec<XObject>> {
        let mut objects = Vec::new();
        while let Some(token) = self.token() {
            match token {
                TOKEN_TEMPLATE => self.skip_template()?,
                TOKEN_NAME => {
                    let template = self.text("object")?;
                    objects.push(self.parse_object(template)?);
                }
                other => self.skip_payload(other, "file")?,
            }
        }
        Ok(objects)
    }

    /// 模板名已读入
    fn parse_object(&mut self, template: String) -> Result<XObject> {
        let mut object = XObject::new(template);
        if self.peek_token() == Some(TOKEN_NAME) {
            object.name = Some(self.name("object name")?);
        }
        let what = object.template.clone();
        self.expect(TOKEN_OBRACE, &what)?;
        if self.peek_token() == Some(TOKEN_GUID) {
            self.pos += 2;
            self.skip_payload(TOKEN_GUID, &what)?;
        }

        loop {
            let token = self.token().ok_or_else(|| Self::eof(&what))?;
            match token {
                TOKEN_CBRACE => return Ok(object),
                TOKEN_NAME => {
                    let name = self.text(&what)?;
                    match self.peek_token() {
                        Some(TOKEN_NAME) | Some(TOKEN_OBRACE) => {
                            let child = self.parse_object(name)?;
                            object.children.push(XChild::Object(child));
                        }
                        _ => object.strings.push(name),
                    }
                }
                TOKEN_OBRACE => {
                    let mut reference = None;
                    loop {
                        match self.token().ok_or_else(|| Self::eof(&what))? {
                            TOKEN_CBRACE => break,
                            TOKEN_NAME => reference = Some(self.text(&what)?),
                            other => self.skip_payload(other, &what)?,
                        }
                    }
                    if let Some(name) = reference {
                        object.children.push(XChild::Reference(name));
                    }
                }
                TOKEN_INTEGER => {
                    let v = self.dword(&what)?;
                    object.values.push(v as f64);
                }
                TOKEN_INTEGER_LIST => {
                    let n = self.dword(&what)?;
                    for _ in 0..n {
                        let v = self.dword(&what)?;
                        object.values.push(v as f64);
                    }
                }
                TOKEN_FLOAT_LIST => {
                    let n = self.dword(&what)?;
                    for _ in 0..n {
                        let v = self.float(&what)?;
                        object.values.push(v);
                    }
                }
                TOKEN_STRING => {
                    let s = self.text(&what)?;
                    object.strings.push(s);
                }
                TOKEN_COMMA | TOKEN_SEMICOLON => {}
                TOKEN_GUID => self.skip_payload(TOKEN_GUID, &what)?,
                other => {
                    return Err(MmdError::ParseFailed(format!(
                        "x binary: unexpected token {} in {}",
                        other, what
                    )))
                }
            }
        }
    }
}

/// 解析包含头部的完整数据
pub fn parse(data: &[u8]) -> Result<Vec<XObject>> {
    if data.len() < HEADER_SIZE {
        return Err(MmdError::ParseFailed("x header is truncated".into()));
    }
    let float_size = if &data[12..16] == b"0064" { 8 } else { 4 };
    let mut reader = TokenReader {
        data,
        pos: HEADER_SIZE,
        float_size,
    };
    reader.parse_file()
}

/// 测试用的记号流构造器
#[cfg(test)]
pub(crate) struct TokenWriter {
    pub bytes: Vec<u8>,
}

#[cfg(test)]
impl TokenWriter {
    pub fn new(format: &[u8; 4]) -> Self {
        let mut bytes = b"xof 0303".to_vec();
        bytes.extend_from_slice(format);
        bytes.extend_from_slice(b"0032");
        Self { bytes }
    }

    pub fn token(&mut self, token: u16) -> &mut Self {
        self.bytes.extend_from_slice(&token.to_le_bytes());
        self
    }

    pub fn name(&mut self, name: &str) -> &mut Self {
        let encoded = crate::pmx::text::encode_shift_jis(name);
        self.token(TOKEN_NAME);
        self.bytes.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&encoded);
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        let encoded = crate::pmx::text::encode_shift_jis(s);
        self.token(TOKEN_STRING);
        self.bytes.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(&encoded);
        self.token(TOKEN_SEMICOLON)
    }

    pub fn ints(&mut self, values: &[u32]) -> &mut Self {
        self.token(TOKEN_INTEGER_LIST);
        self.bytes.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for v in values {
            self.bytes.extend_from_slice(&v.to_le_bytes());
        }
        self
    }

    pub fn floats(&mut self, values: &[f32]) -> &mut Self {
        self.token(TOKEN_FLOAT_LIST);
        self.bytes.extend_from_slice(&(values.len() as u32).to_le_bytes());
        for v in values {
            self.bytes.extend_from_slice(&v.to_le_bytes());
        }
        self
    }

    pub fn open(&mut self, template: &str) -> &mut Self {
        self.name(template).token(TOKEN_OBRACE)
    }

    pub fn close(&mut self) -> &mut Self {
        self.token(TOKEN_CBRACE)
    }
}

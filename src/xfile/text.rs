//! 文本方言的词法和语法分析

use super::{XChild, XObject};
use crate::pmx::text::decode_shift_jis;
use crate::{MmdError, Result};

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Guid,
    LBrace,
    RBrace,
    Separator,
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i += 2;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            ';' | ',' => {
                tokens.push(Token::Separator);
                i += 1;
            }
            '<' => {
                while i < chars.len() && chars[i] != '>' {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(MmdError::ParseFailed("unterminated GUID".into()));
                }
                tokens.push(Token::Guid);
                i += 1;
            }
            '"' => {
                let start = i + 1;
                i = start;
                while i < chars.len() && chars[i] != '"' {
                    i += 1;
                }
                tokens.push(Token::Str(chars[start..i.min(chars.len())].iter().collect()));
                i += 1;
            }
            _ if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                let start = i;
                while i < chars.len() && is_number_char(chars[i]) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| MmdError::ParseFailed(format!("bad number {:?}", text)))?;
                tokens.push(Token::Number(value));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '-') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => i += 1,
        }
    }
    Ok(tokens)
}

fn is_number_char(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E')
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect_lbrace(&mut self, what: &str) -> Result<()> {
        match self.next() {
            Some(Token::LBrace) => Ok(()),
            other => Err(MmdError::ParseFailed(format!("{}: expected '{{', got {:?}", what, other))),
        }
    }

    /// 跳到与已读入的 `{` 配对的 `}` 之后
    fn skip_block(&mut self, what: &str) -> Result<()> {
        let mut depth = 1;
        while depth > 0 {
            match self.next() {
                Some(Token::LBrace) => depth += 1,
                Some(Token::RBrace) => depth -= 1,
                Some(_) => {}
                None => return Err(MmdError::ParseFailed(format!("{}: unterminated block", what))),
            }
        }
        Ok(())
    }

    fn is_object_start(&self) -> bool {
        match (self.peek(), self.peek_at(1), self.peek_at(2)) {
            (Some(Token::Ident(_)), Some(Token::LBrace), _) => true,
            (Some(Token::Ident(_)), Some(Token::Ident(_)), Some(Token::LBrace)) => true,
            _ => false,
        }
    }

    fn parse_file(&mut self) -> Result<Vec<XObject>> {
        let mut objects = Vec::new();
        while let Some(token) = self.peek() {
            match token {
                Token::Ident(word) if word == "template" => {
                    self.pos += 2;
                    self.expect_lbrace("template")?;
                    self.skip_block("template")?;
                }
                Token::Ident(_) if self.is_object_start() => objects.push(self.parse_object()?),
                _ => self.pos += 1,
            }
        }
        Ok(objects)
    }

    fn parse_object(&mut self) -> Result<XObject> {
        let template = match self.next() {
            Some(Token::Ident(t)) => t,
            other => return Err(MmdError::ParseFailed(format!("expected template name, got {:?}", other))),
        };
        let mut object = XObject::new(template);
        if let Some(Token::Ident(name)) = self.peek() {
            object.name = Some(name.clone());
            self.pos += 1;
        }
        let what = object.template.clone();
        self.expect_lbrace(&what)?;
        if self.peek() == Some(&Token::Guid) {
            self.pos += 1;
        }

        loop {
            match self.peek() {
                None => return Err(MmdError::ParseFailed(format!("{}: unexpected end of file", what))),
                Some(Token::RBrace) => {
                    self.pos += 1;
                    return Ok(object);
                }
                Some(Token::Ident(_)) if self.is_object_start() => {
                    let child = self.parse_object()?;
                    object.children.push(XChild::Object(child));
                }
                Some(Token::LBrace) => {
                    self.pos += 1;
                    let mut reference = None;
                    while let Some(token) = self.next() {
                        match token {
                            Token::RBrace => break,
                            Token::Ident(name) => reference = Some(name),
                            Token::Guid => {}
                            other => {
                                return Err(MmdError::ParseFailed(format!(
                                    "{}: bad reference token {:?}",
                                    what, other
                                )))
                            }
                        }
                    }
                    if let Some(name) = reference {
                        object.children.push(XChild::Reference(name));
                    }
                }
                Some(_) => match self.next() {
                    Some(Token::Number(v)) => object.values.push(v),
                    Some(Token::Str(s)) => object.strings.push(s),
                    Some(Token::Ident(s)) => object.strings.push(s),
                    _ => {}
                },
            }
        }
    }
}

/// 解析头部之后的文本
pub fn parse(body: &[u8]) -> Result<Vec<XObject>> {
    let source = decode_shift_jis(body);
    let tokens = tokenize(&source)?;
    log::debug!("x text: {} tokens", tokens.len());
    Parser { tokens, pos: 0 }.parse_file()
}

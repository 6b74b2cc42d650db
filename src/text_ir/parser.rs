//! Parser for the textual IR produced by [`crate::dump`].

use crate::core::builder::InsnSeq;
use crate::core::error::{CompileError, CompileResult};
use crate::core::insn::Op;
use crate::core::operand::{CodePtr, Opnd, Reg, SpecialReg, Value};
use crate::x64::regs;

pub fn parse_ir(text: &str) -> CompileResult<InsnSeq> {
    let mut seq = InsnSeq::new();
    for (i, line) in text.lines().enumerate() {
        let mut parser = Parser {
            text: line,
            pos: 0,
            line: i + 1,
        };
        parser.parse_line(&mut seq)?;
    }
    Ok(seq)
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
    line: usize,
}

impl<'a> Parser<'a> {
    fn error<T>(&self, message: impl Into<String>) -> CompileResult<T> {
        Err(CompileError::Parse {
            line: self.line,
            message: message.into(),
        })
    }

    fn rest(&self) -> &'a str {
        &self.text[self.pos..]
    }

    fn current_char(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn advance(&mut self) {
        if let Some(ch) = self.current_char() {
            self.pos += ch.len_utf8();
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.current_char() {
            if ch == ';' {
                self.pos = self.text.len();
            } else if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn is_eol(&mut self) -> bool {
        self.skip_whitespace();
        self.pos >= self.text.len()
    }

    fn try_read(&mut self, ch: char) -> bool {
        self.skip_whitespace();
        if self.current_char() == Some(ch) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, ch: char) -> CompileResult<()> {
        if !self.try_read(ch) {
            return self.error(format!(
                "expected '{}' but found {:?}",
                ch,
                self.current_char()
            ));
        }
        Ok(())
    }

    fn read_while(&mut self, pred: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(ch) = self.current_char() {
            if !pred(ch) {
                break;
            }
            self.advance();
        }
        &self.text[start..self.pos]
    }

    fn read_identifier(&mut self) -> CompileResult<&'a str> {
        self.skip_whitespace();
        let ident = self.read_while(|c| c.is_ascii_alphanumeric() || c == '_');
        if ident.is_empty() {
            return self.error(format!("expected identifier but found {:?}", self.current_char()));
        }
        Ok(ident)
    }

    fn read_u64(&mut self) -> CompileResult<u64> {
        self.skip_whitespace();
        let parsed = if self.rest().starts_with("0x") {
            self.pos += 2;
            let digits = self.read_while(|c| c.is_ascii_hexdigit());
            u64::from_str_radix(digits, 16)
        } else {
            self.read_while(|c| c.is_ascii_digit()).parse::<u64>()
        };
        match parsed {
            Ok(v) => Ok(v),
            Err(e) => self.error(format!("invalid number: {e}")),
        }
    }

    /// Signed integer; unsigned values above `i64::MAX` keep their bit pattern.
    fn read_int(&mut self) -> CompileResult<i64> {
        let negative = self.try_read('-');
        let magnitude = self.read_u64()?;
        if negative {
            if magnitude > i64::MAX as u64 + 1 {
                return self.error("integer out of range");
            }
            Ok((magnitude as i64).wrapping_neg())
        } else {
            Ok(magnitude as i64)
        }
    }

    /// Optional `:iN` width suffix.
    fn read_width(&mut self) -> CompileResult<Option<u8>> {
        if !self.rest().starts_with(":i") {
            return Ok(None);
        }
        self.pos += 2;
        let bits = self.read_u64()?;
        match u8::try_from(bits) {
            Ok(bits) => Ok(Some(bits)),
            Err(_) => self.error(format!("invalid width {bits}")),
        }
    }

    fn read_string(&mut self) -> CompileResult<String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            let Some(ch) = self.current_char() else {
                return self.error("unterminated string");
            };
            self.advance();
            match ch {
                '"' => return Ok(out),
                '\\' => {
                    let Some(esc) = self.current_char() else {
                        return self.error("unterminated escape");
                    };
                    self.advance();
                    match esc {
                        'n' => out.push('\n'),
                        't' => out.push('\t'),
                        'r' => out.push('\r'),
                        '0' => out.push('\0'),
                        '\\' | '"' | '\'' => out.push(esc),
                        'u' => {
                            self.expect('{')?;
                            let digits = self.read_while(|c| c.is_ascii_hexdigit());
                            let code = u32::from_str_radix(digits, 16).ok().and_then(char::from_u32);
                            let Some(c) = code else {
                                return self.error("invalid unicode escape");
                            };
                            self.expect('}')?;
                            out.push(c);
                        }
                        other => return self.error(format!("unknown escape '\\{other}'")),
                    }
                }
                _ => out.push(ch),
            }
        }
    }

    fn register(&self, name: &str) -> CompileResult<Option<Reg>> {
        if let Some(slot) = SpecialReg::from_name(name) {
            return Ok(Some(Reg::special(slot)));
        }
        match regs::from_name(name) {
            Some(reg) => Reg::new(reg).map(Some),
            None => Ok(None),
        }
    }

    fn parse_mem(&mut self, bits: &str) -> CompileResult<Opnd> {
        let Ok(num_bits) = bits.parse::<u8>() else {
            return self.error(format!("invalid memory width '{bits}'"));
        };
        self.expect('[')?;
        let base_name = self.read_identifier()?;
        let Some(base) = self.register(base_name)? else {
            return self.error(format!("unknown base register '{base_name}'"));
        };
        let disp = if self.try_read('+') {
            self.read_int()?
        } else if self.try_read('-') {
            -self.read_int()?
        } else {
            0
        };
        self.expect(']')?;
        let Ok(disp) = i32::try_from(disp) else {
            return self.error(format!("displacement {disp} out of range"));
        };
        Opnd::mem(num_bits, Opnd::reg(base), disp)
    }

    fn parse_opnd(&mut self, seq: &mut InsnSeq) -> CompileResult<Opnd> {
        self.skip_whitespace();
        match self.current_char() {
            Some('%') => {
                self.advance();
                let idx = self.read_u64()?;
                match u32::try_from(idx) {
                    Ok(idx) => Ok(Opnd::out(idx)),
                    Err(_) => self.error(format!("result number {idx} out of range")),
                }
            }
            Some('@') => {
                self.advance();
                let name = self.read_while(|c| !c.is_whitespace() && c != ',' && c != ';');
                if name.is_empty() {
                    return self.error("empty label name");
                }
                Ok(seq.new_label(name).opnd())
            }
            Some('"') => {
                let text = self.read_string()?;
                Ok(Opnd::Str(seq.intern(&text)))
            }
            Some(c) if c == '-' || c.is_ascii_digit() => {
                let value = self.read_int()?;
                match self.read_width()? {
                    Some(bits) => Opnd::imm_sized(value, bits),
                    None => Ok(Opnd::imm(value)),
                }
            }
            Some(_) => {
                let ident = self.read_identifier()?;
                match ident {
                    "void" => Ok(Opnd::Void),
                    "value" => {
                        self.expect('(')?;
                        let v = self.read_u64()?;
                        self.expect(')')?;
                        Ok(Opnd::value(Value(v)))
                    }
                    "code" => {
                        self.expect('(')?;
                        let addr = self.read_u64()?;
                        self.expect(')')?;
                        Opnd::code_ptr(CodePtr::new(addr as usize))
                    }
                    "label" if self.current_char() == Some('#') => {
                        self.error("resolved label indices cannot appear in builder-level input")
                    }
                    _ if ident.starts_with("mem") && self.rest().trim_start().starts_with('[') => {
                        self.parse_mem(&ident[3..])
                    }
                    _ => {
                        let Some(reg) = self.register(ident)? else {
                            return self.error(format!("unknown operand '{ident}'"));
                        };
                        match self.read_width()? {
                            None | Some(64) => Ok(Opnd::reg(reg)),
                            Some(num_bits) => Err(CompileError::WidthMismatch { num_bits }),
                        }
                    }
                }
            }
            None => self.error("expected operand"),
        }
    }

    fn parse_line(&mut self, seq: &mut InsnSeq) -> CompileResult<()> {
        if self.is_eol() {
            return Ok(());
        }

        // Dumped positions are informational.
        if self.try_read('[') {
            self.read_u64()?;
            self.expect(']')?;
        }

        let mut result = None;
        if self.try_read('%') {
            let k = self.read_u64()?;
            self.expect('=')?;
            if k != seq.len() as u64 {
                return self.error(format!(
                    "result %{k} does not match instruction number {}",
                    seq.len()
                ));
            }
            result = Some(k);
        }

        let name = self.read_identifier()?;
        let Some(op) = Op::from_name(name) else {
            return self.error(format!("unknown instruction '{name}'"));
        };

        let mut opnds = Vec::new();
        if !self.is_eol() {
            loop {
                opnds.push(self.parse_opnd(seq)?);
                if !self.try_read(',') {
                    break;
                }
            }
        }
        if !self.is_eol() {
            return self.error(format!("unexpected trailing input '{}'", self.rest()));
        }

        let out = seq.push_insn(op, opnds)?;
        if result.is_some() && out == Opnd::Void {
            return self.error(format!("{name} produces no value"));
        }
        Ok(())
    }
}

//! One-pass BASIC parser and bytecode emitter.
//!
//! Source is pulled one byte at a time from the host capability, lowered
//! straight into the code store while the parser tracks scopes, the
//! static stack depth and forward references. Branches inside structured
//! statements are patched in place; GOTO and sub calls emit link
//! placeholders carrying symbol table indices for the linker.

use mcbcore::bytecode::Instr;
use mcbcore::codestore::StoreError;
use mcbcore::config::{LOOKAHEAD, MAX_LABEL_NUM, MAX_NAME, MAX_SUB_NUM, MAX_VAR_NUM, STACK_SIZE};
use mcbcore::strpool::PoolError;
use mcbcore::system::System;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ParseError {
    NameInv = -1,
    NameKeyword = -2,
    CodeMem = -3,
    VarUndefined = -4,
    VarCount = -5,
    RegNotFound = -6,
    StringInv = -7,
    StringLength = -8,
    StringMem = -9,
    BracketMissing = -10,
    NumberInv = -11,
    ExpectedNl = -12,
    ExpectedThen = -13,
    ExpectedEndIf = -14,
    ExpectedLoop = -15,
    ExpectedEq = -16,
    ExpectedTo = -17,
    ExpectedNext = -18,
    ExpectedExpr = -19,
    ExpectedEof = -20,
    LabelDup = -21,
    LabelInv = -22,
    LabelMissing = -23,
    CallBrackets = -24,
    SubNotFound = -25,
    ArgCount = -26,
    ExitOutside = -27,
    SubNested = -28,
    SvcNameClash = -29,
    SubDup = -30,
    LocalNotFound = -31,
    NotAnArray = -32,
    NotAScalar = -33,
    DimInv = -34,
}

impl ParseError {
    pub fn code(&self) -> i32 {
        *self as i32
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ParseError::NameInv => "Invalid name",
            ParseError::NameKeyword => "Keyword used as name",
            ParseError::CodeMem => "Code memory exhausted",
            ParseError::VarUndefined => "Variable undefined",
            ParseError::VarCount => "Too many variables",
            ParseError::RegNotFound => "Register not found",
            ParseError::StringInv => "Invalid string",
            ParseError::StringLength => "String too long",
            ParseError::StringMem => "String memory exhausted",
            ParseError::BracketMissing => "Unbalanced brackets",
            ParseError::NumberInv => "Invalid number",
            ParseError::ExpectedNl => "Expected end of line",
            ParseError::ExpectedThen => "Expected THEN",
            ParseError::ExpectedEndIf => "Expected END IF",
            ParseError::ExpectedLoop => "Expected LOOP",
            ParseError::ExpectedEq => "Expected =",
            ParseError::ExpectedTo => "Expected TO",
            ParseError::ExpectedNext => "Expected NEXT",
            ParseError::ExpectedExpr => "Expected expression",
            ParseError::ExpectedEof => "Expected end of file",
            ParseError::LabelDup => "Duplicate label",
            ParseError::LabelInv => "Invalid label",
            ParseError::LabelMissing => "Label not found",
            ParseError::CallBrackets => "Call brackets missing",
            ParseError::SubNotFound => "Sub not found",
            ParseError::ArgCount => "Argument count mismatch",
            ParseError::ExitOutside => "EXIT outside its construct",
            ParseError::SubNested => "Nested SUB",
            ParseError::SvcNameClash => "Name clashes with a service",
            ParseError::SubDup => "Duplicate sub",
            ParseError::LocalNotFound => "Local not found",
            ParseError::NotAnArray => "Not an array",
            ParseError::NotAScalar => "Not a scalar",
            ParseError::DimInv => "Bad dimension",
        };
        write!(f, "{}", msg)
    }
}

impl std::error::Error for ParseError {}

impl From<StoreError> for ParseError {
    fn from(_: StoreError) -> Self {
        ParseError::CodeMem
    }
}

impl From<PoolError> for ParseError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::OutOfMemory => ParseError::StringMem,
            PoolError::BadRange(..) => ParseError::StringInv,
        }
    }
}

/// First parse error together with the cursor position it happened at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseReport {
    pub kind: ParseError,
    pub line: u32,
    pub col: u32,
}

impl std::fmt::Display for ParseReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parse error at line {} column {}: {}",
            self.line, self.col, self.kind
        )
    }
}

impl std::error::Error for ParseReport {}

#[derive(Debug, Clone)]
pub struct LabelEntry {
    /// None for the synthetic exit label of a loop.
    pub name: Option<String>,
    pub dst: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct SubEntry {
    pub name: String,
    pub entry: Option<u16>,
    /// Fixed by whichever of the definition or the first call comes first.
    pub argc: Option<i16>,
}

/// Symbol tables consumed by the linker, then discarded.
#[derive(Debug)]
pub struct LinkTables {
    pub labels: Vec<LabelEntry>,
    pub subs: Vec<SubEntry>,
}

#[derive(Debug, Clone)]
struct Var {
    name: String,
    /// Absolute slot for globals, frame-relative for sub locals
    /// (negative reaches parameters below the label cell).
    index: i16,
    level: u32,
    /// 0 scalar, > 0 inline array, < 0 array-by-reference parameter.
    dim: i16,
}

impl Var {
    fn slots(&self) -> i32 {
        if self.dim > 0 { self.dim as i32 } else { 1 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Do,
    For,
}

struct LoopCtx {
    kind: LoopKind,
    /// Scope level of the loop body, EXIT pops everything at or above it.
    level: u32,
    exit_label: Option<i16>,
}

/// How a statement ended, so enclosing constructs see their own
/// terminating keywords without extra lookahead.
enum Stmt {
    Normal,
    Eof,
    EndIf,
    EndSub,
    ElseIf,
    Else,
    LoopEnd,
    Next,
}

const KEYWORDS: &[&str] = &[
    "and", "dim", "do", "else", "elseif", "end", "exit", "explicit", "false", "for", "goto", "if",
    "let", "loop", "mod", "next", "not", "off", "on", "option", "or", "print", "rem", "return",
    "step", "sub", "then", "to", "true", "until", "while", "xor",
];

fn is_keyword(name: &str) -> bool {
    KEYWORDS.iter().any(|kw| name.eq_ignore_ascii_case(kw))
}

fn is_word(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c == b'$'
}

/// Static stack effect of one emitted instruction. GOSUB, SVC and
/// RETURN carry table-dependent argument counts, the call sites apply
/// those on top of the classification.
fn stack_effect(instr: &Instr) -> i32 {
    match *instr {
        Instr::Print { argc } => -(argc as i32 + 1),
        Instr::LetGlobal { dim, .. } | Instr::LetLocal { dim, .. } => {
            if dim > 0 { -2 } else { -1 }
        }
        Instr::LetPtr { .. } => -2,
        Instr::LetReg { .. } => -1,
        Instr::If { .. } => -1,
        Instr::Goto { .. } | Instr::LnkGoto { .. } | Instr::Nop | Instr::End => 0,
        Instr::Gosub { .. } | Instr::LnkGosub { .. } | Instr::Svc { .. } => 0,
        Instr::Return { .. } => -1,
        Instr::Pop { count } => -(count as i32 + 1),
        Instr::GetGlobal { dim, .. } | Instr::GetLocal { dim, .. } => {
            if dim > 0 { 0 } else { 1 }
        }
        Instr::GetPtr { .. } => 0,
        Instr::GetReg { .. } => 1,
        Instr::CreatePtr { .. } => 1,
        Instr::Zero
        | Instr::Int { .. }
        | Instr::Float { .. }
        | Instr::Str { .. }
        | Instr::Ptr { .. }
        | Instr::Label { .. } => 1,
        Instr::Not | Instr::Sign => 0,
        Instr::Neq
        | Instr::Lteq
        | Instr::Gteq
        | Instr::Lt
        | Instr::Gt
        | Instr::Equal
        | Instr::Xor
        | Instr::Or
        | Instr::And
        | Instr::Shl
        | Instr::Shr
        | Instr::Plus
        | Instr::Minus
        | Instr::Mod
        | Instr::Mult
        | Instr::Div
        | Instr::IDiv
        | Instr::Pow => -1,
    }
}

pub struct Parser {
    window: [u8; LOOKAHEAD],
    len: usize,
    /// Last consumed byte, primed with a newline so keyword boundary
    /// checks always have one character of lookbehind.
    prev: u8,
    in_string: bool,
    eof: bool,
    line: u32,
    col: u32,
    /// Static stack depth, counted within the current frame.
    sp: i32,
    level: u32,
    explicit: bool,
    vars: Vec<Var>,
    labels: Vec<LabelEntry>,
    subs: Vec<SubEntry>,
    loops: Vec<LoopCtx>,
    /// Argument count of the sub currently being parsed.
    sub_argc: Option<i16>,
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            window: [0; LOOKAHEAD],
            len: 0,
            prev: b'\n',
            in_string: false,
            eof: false,
            line: 1,
            col: 1,
            sp: 0,
            level: 0,
            explicit: false,
            vars: Vec::new(),
            labels: Vec::new(),
            subs: Vec::new(),
            loops: Vec::new(),
            sub_argc: None,
        }
    }

    /// Parse the whole source into the code store. Returns the symbol
    /// tables for the linker, or the first error with its position.
    pub fn parse_all(mut self, sys: &mut System) -> Result<LinkTables, ParseReport> {
        match self.program(sys) {
            Ok(()) => Ok(LinkTables {
                labels: self.labels,
                subs: self.subs,
            }),
            Err(kind) => Err(ParseReport {
                kind,
                line: self.line,
                col: self.col,
            }),
        }
    }

    fn program(&mut self, sys: &mut System) -> Result<(), ParseError> {
        self.fill(sys);
        loop {
            match self.statement(sys)? {
                Stmt::Normal => {}
                Stmt::Eof => break,
                _ => return Err(ParseError::ExpectedEof),
            }
        }
        // Guarantee termination even without an explicit END.
        self.emit(sys, Instr::End)?;
        Ok(())
    }

    // ---- lexical layer ----------------------------------------------

    fn fill(&mut self, sys: &mut System) {
        while self.len < LOOKAHEAD && !self.eof {
            let mut c = (sys.source)();
            if c == 0 {
                self.eof = true;
                break;
            }
            if c == b'\r' {
                continue;
            }
            if c == b'\t' {
                c = b' ';
            }
            if c == b'"' {
                self.in_string = !self.in_string;
            } else if c == b'\'' && !self.in_string {
                // Comment runs to end of line, the newline survives.
                loop {
                    let skipped = (sys.source)();
                    if skipped == 0 {
                        self.eof = true;
                        break;
                    }
                    if skipped == b'\n' {
                        break;
                    }
                }
                if self.eof {
                    break;
                }
                c = b'\n';
            }
            self.window[self.len] = c;
            self.len += 1;
        }
    }

    fn peek(&self, i: usize) -> u8 {
        if i < self.len { self.window[i] } else { 0 }
    }

    fn at_end(&self) -> bool {
        self.len == 0 && self.eof
    }

    fn advance(&mut self, sys: &mut System, n: usize) {
        let n = n.min(self.len);
        for i in 0..n {
            let c = self.window[i];
            self.prev = c;
            if c == b'\n' {
                self.line += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
        self.window.copy_within(n..self.len, 0);
        self.len -= n;
        self.fill(sys);
    }

    fn skip_space(&mut self, sys: &mut System) {
        while self.peek(0) == b' ' {
            self.advance(sys, 1);
        }
    }

    /// Case-insensitive whole-word match, consumed only when bounded by
    /// non-word characters on both sides.
    fn accept_kw(&mut self, sys: &mut System, kw: &str) -> bool {
        self.skip_space(sys);
        if is_word(self.prev) {
            return false;
        }
        let bytes = kw.as_bytes();
        for (i, b) in bytes.iter().enumerate() {
            if !self.peek(i).eq_ignore_ascii_case(b) {
                return false;
            }
        }
        if is_word(self.peek(bytes.len())) {
            return false;
        }
        self.advance(sys, bytes.len());
        true
    }

    fn accept_sym(&mut self, sys: &mut System, sym: &str) -> bool {
        self.skip_space(sys);
        let bytes = sym.as_bytes();
        for (i, b) in bytes.iter().enumerate() {
            if self.peek(i) != *b {
                return false;
            }
        }
        self.advance(sys, bytes.len());
        true
    }

    fn accept_ch(&mut self, sys: &mut System, c: u8) -> bool {
        self.skip_space(sys);
        if self.peek(0) == c {
            self.advance(sys, 1);
            return true;
        }
        false
    }

    /// Identifier: letter or underscore, then letters, digits and
    /// underscores, bounded by MAX_NAME.
    fn take_name(&mut self, sys: &mut System) -> Result<Option<String>, ParseError> {
        self.skip_space(sys);
        let c0 = self.peek(0);
        if !(c0.is_ascii_alphabetic() || c0 == b'_') {
            return Ok(None);
        }
        let mut n = 0;
        while self.peek(n).is_ascii_alphanumeric() || self.peek(n) == b'_' {
            n += 1;
            if n > MAX_NAME {
                return Err(ParseError::NameInv);
            }
        }
        let name = String::from_utf8_lossy(&self.window[..n]).into_owned();
        self.advance(sys, n);
        Ok(Some(name))
    }

    fn expect_nl(&mut self, sys: &mut System) -> Result<(), ParseError> {
        self.skip_space(sys);
        if self.at_end() {
            return Ok(());
        }
        if self.peek(0) == b'\n' {
            self.advance(sys, 1);
            return Ok(());
        }
        Err(ParseError::ExpectedNl)
    }

    fn skip_line(&mut self, sys: &mut System) {
        while !self.at_end() && self.peek(0) != b'\n' {
            self.advance(sys, 1);
        }
        if self.peek(0) == b'\n' {
            self.advance(sys, 1);
        }
    }

    // ---- emission helpers -------------------------------------------

    fn emit(&mut self, sys: &mut System, instr: Instr) -> Result<u16, ParseError> {
        let offset = sys.code.add(&instr)?;
        self.sp += stack_effect(&instr);
        Ok(offset)
    }

    fn patch(&self, sys: &mut System, offset: u16, instr: Instr) -> Result<(), ParseError> {
        sys.code.set(offset, &instr)?;
        Ok(())
    }

    fn in_sub(&self) -> bool {
        self.sub_argc.is_some()
    }

    fn get_var(&self, name: &str) -> Option<Var> {
        self.vars.iter().rev().find(|v| v.name == name).cloned()
    }

    /// Register a variable whose slots were just emitted. Shadowing at a
    /// deeper level is allowed, a duplicate at the same level is not.
    fn add_var(&mut self, name: String, dim: i16) -> Result<Var, ParseError> {
        if is_keyword(&name) {
            return Err(ParseError::NameKeyword);
        }
        if self
            .vars
            .iter()
            .any(|v| v.level == self.level && v.name == name)
        {
            return Err(ParseError::NameInv);
        }
        if self.vars.len() >= MAX_VAR_NUM {
            return Err(ParseError::VarCount);
        }
        let slots = if dim > 0 { dim as i32 } else { 1 };
        let index = if self.in_sub() {
            self.sp - slots + 1
        } else {
            self.sp - slots
        };
        let var = Var {
            name,
            index: index as i16,
            level: self.level,
            dim,
        };
        self.vars.push(var.clone());
        Ok(var)
    }

    /// Nameless slot for FOR loop bookkeeping, retired with its level.
    fn add_hidden(&mut self) -> Result<Var, ParseError> {
        if self.vars.len() >= MAX_VAR_NUM {
            return Err(ParseError::VarCount);
        }
        let index = if self.in_sub() { self.sp } else { self.sp - 1 };
        let var = Var {
            name: String::new(),
            index: index as i16,
            level: self.level,
            dim: 0,
        };
        self.vars.push(var.clone());
        Ok(var)
    }

    fn emit_get(&mut self, sys: &mut System, var: &Var) -> Result<(), ParseError> {
        let instr = if var.level == 0 {
            Instr::GetGlobal {
                index: var.index,
                dim: 0,
            }
        } else {
            Instr::GetLocal {
                index: var.index,
                dim: 0,
            }
        };
        self.emit(sys, instr)?;
        Ok(())
    }

    fn emit_let(&mut self, sys: &mut System, var: &Var) -> Result<(), ParseError> {
        let instr = if var.level == 0 {
            Instr::LetGlobal {
                index: var.index,
                dim: 0,
            }
        } else {
            Instr::LetLocal {
                index: var.index,
                dim: 0,
            }
        };
        self.emit(sys, instr)?;
        Ok(())
    }

    /// Retire the current level's variables and collapse their slots
    /// with a single POP.
    fn block_close(&mut self, sys: &mut System) -> Result<(), ParseError> {
        let mut slots = 0;
        while let Some(var) = self.vars.last() {
            if var.level != self.level {
                break;
            }
            slots += var.slots();
            self.vars.pop();
        }
        if slots > 0 {
            self.emit(
                sys,
                Instr::Pop {
                    count: (slots - 1) as i16,
                },
            )?;
        }
        Ok(())
    }

    // ---- symbol tables ----------------------------------------------

    fn label_index(&mut self, name: &str) -> Result<usize, ParseError> {
        if let Some(i) = self
            .labels
            .iter()
            .position(|l| l.name.as_deref() == Some(name))
        {
            return Ok(i);
        }
        if self.labels.len() >= MAX_LABEL_NUM {
            return Err(ParseError::LabelInv);
        }
        self.labels.push(LabelEntry {
            name: Some(name.to_string()),
            dst: None,
        });
        Ok(self.labels.len() - 1)
    }

    fn synthetic_label(&mut self) -> Result<usize, ParseError> {
        if self.labels.len() >= MAX_LABEL_NUM {
            return Err(ParseError::LabelInv);
        }
        self.labels.push(LabelEntry {
            name: None,
            dst: None,
        });
        Ok(self.labels.len() - 1)
    }

    fn def_label(&mut self, name: &str, dst: u16) -> Result<(), ParseError> {
        let i = self.label_index(name)?;
        if self.labels[i].dst.is_some() {
            return Err(ParseError::LabelDup);
        }
        self.labels[i].dst = Some(dst);
        Ok(())
    }

    fn sub_index(&mut self, name: &str) -> Result<usize, ParseError> {
        if let Some(i) = self
            .subs
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(name))
        {
            return Ok(i);
        }
        if self.subs.len() >= MAX_SUB_NUM {
            return Err(ParseError::SubNotFound);
        }
        self.subs.push(SubEntry {
            name: name.to_string(),
            entry: None,
            argc: None,
        });
        Ok(self.subs.len() - 1)
    }

    // ---- statements -------------------------------------------------

    fn statement(&mut self, sys: &mut System) -> Result<Stmt, ParseError> {
        self.skip_space(sys);
        if self.at_end() {
            return Ok(Stmt::Eof);
        }
        if self.accept_ch(sys, b'\n') {
            return Ok(Stmt::Normal);
        }
        if self.accept_kw(sys, "rem") {
            self.skip_line(sys);
            return Ok(Stmt::Normal);
        }
        if self.accept_kw(sys, "dim") {
            return self.stmt_dim(sys);
        }
        if self.accept_kw(sys, "print") {
            return self.stmt_print(sys);
        }
        if self.accept_kw(sys, "if") {
            return self.stmt_if(sys);
        }
        if self.accept_kw(sys, "do") {
            return self.stmt_do(sys);
        }
        if self.accept_kw(sys, "for") {
            return self.stmt_for(sys);
        }
        if self.accept_kw(sys, "sub") {
            return self.stmt_sub(sys);
        }
        if self.accept_kw(sys, "exit") {
            return self.stmt_exit(sys);
        }
        if self.accept_kw(sys, "return") {
            return self.stmt_return(sys);
        }
        if self.accept_kw(sys, "goto") {
            return self.stmt_goto(sys);
        }
        if self.accept_kw(sys, "option") {
            return self.stmt_option(sys);
        }
        if self.accept_kw(sys, "elseif") {
            return Ok(Stmt::ElseIf);
        }
        if self.accept_kw(sys, "else") {
            return Ok(Stmt::Else);
        }
        if self.accept_kw(sys, "loop") {
            return Ok(Stmt::LoopEnd);
        }
        if self.accept_kw(sys, "next") {
            return Ok(Stmt::Next);
        }
        if self.accept_kw(sys, "end") {
            if self.accept_kw(sys, "if") {
                return Ok(Stmt::EndIf);
            }
            if self.accept_kw(sys, "sub") {
                return Ok(Stmt::EndSub);
            }
            self.emit(sys, Instr::End)?;
            self.expect_nl(sys)?;
            return Ok(Stmt::Normal);
        }
        if self.accept_kw(sys, "let") {
            let Some(name) = self.take_name(sys)? else {
                return Err(ParseError::NameInv);
            };
            return self.assignment_or_call(sys, name, false);
        }
        if self.accept_ch(sys, b'$') {
            return self.stmt_reg_assign(sys);
        }
        let Some(name) = self.take_name(sys)? else {
            return Err(ParseError::NameInv);
        };
        self.skip_space(sys);
        if self.accept_ch(sys, b':') {
            let dst = sys.code.next_index();
            self.def_label(&name, dst)?;
            // An optional statement may follow the label on the same line.
            return self.statement(sys);
        }
        self.assignment_or_call(sys, name, true)
    }

    fn assignment_or_call(
        &mut self,
        sys: &mut System,
        name: String,
        allow_call: bool,
    ) -> Result<Stmt, ParseError> {
        if let Some(var) = self.get_var(&name) {
            if self.accept_ch(sys, b'(') {
                if var.dim == 0 {
                    return Err(ParseError::NotAnArray);
                }
                self.expression(sys)?; // index
                if !self.accept_ch(sys, b')') {
                    return Err(ParseError::BracketMissing);
                }
                if !self.accept_ch(sys, b'=') {
                    return Err(ParseError::ExpectedEq);
                }
                self.expression(sys)?; // value
                let instr = if var.dim < 0 {
                    Instr::LetPtr { index: var.index }
                } else if var.level == 0 {
                    Instr::LetGlobal {
                        index: var.index,
                        dim: var.dim,
                    }
                } else {
                    Instr::LetLocal {
                        index: var.index,
                        dim: var.dim,
                    }
                };
                self.emit(sys, instr)?;
                self.expect_nl(sys)?;
                return Ok(Stmt::Normal);
            }
            if self.accept_ch(sys, b'=') {
                if var.dim != 0 {
                    return Err(ParseError::NotAScalar);
                }
                self.expression(sys)?;
                self.emit_let(sys, &var)?;
                self.expect_nl(sys)?;
                return Ok(Stmt::Normal);
            }
            return Err(ParseError::ExpectedEq);
        }
        if allow_call && let Some((idx, argc)) = sys.find_service(&name) {
            self.call_service(sys, idx, argc)?;
            self.emit(sys, Instr::Pop { count: 0 })?;
            self.expect_nl(sys)?;
            return Ok(Stmt::Normal);
        }
        if self.accept_ch(sys, b'=') {
            if self.explicit {
                return Err(ParseError::VarUndefined);
            }
            // Auto-declare: the expression result becomes the new slot.
            self.expression(sys)?;
            self.add_var(name, 0)?;
            self.expect_nl(sys)?;
            return Ok(Stmt::Normal);
        }
        if allow_call {
            self.call_sub(sys, &name)?;
            self.emit(sys, Instr::Pop { count: 0 })?;
            self.expect_nl(sys)?;
            return Ok(Stmt::Normal);
        }
        Err(ParseError::ExpectedEq)
    }

    fn stmt_reg_assign(&mut self, sys: &mut System) -> Result<Stmt, ParseError> {
        let Some(name) = self.take_name(sys)? else {
            return Err(ParseError::NameInv);
        };
        let Some(reg) = sys.find_register(&name) else {
            return Err(ParseError::RegNotFound);
        };
        if !self.accept_ch(sys, b'=') {
            return Err(ParseError::ExpectedEq);
        }
        self.expression(sys)?;
        self.emit(sys, Instr::LetReg { reg })?;
        self.expect_nl(sys)?;
        Ok(Stmt::Normal)
    }

    fn stmt_dim(&mut self, sys: &mut System) -> Result<Stmt, ParseError> {
        let Some(name) = self.take_name(sys)? else {
            return Err(ParseError::NameInv);
        };
        let mut dim: i16 = 0;
        if self.accept_ch(sys, b'(') {
            dim = self.dim_const(sys)?;
            if !self.accept_ch(sys, b')') {
                return Err(ParseError::BracketMissing);
            }
        }
        if dim == 0 {
            if self.accept_ch(sys, b'=') {
                self.expression(sys)?;
            } else {
                self.emit(sys, Instr::Zero)?;
            }
        } else {
            if self.accept_ch(sys, b'=') {
                // No opcode can replicate one value over the slots.
                return Err(ParseError::DimInv);
            }
            for _ in 0..dim {
                self.emit(sys, Instr::Zero)?;
            }
        }
        self.add_var(name, dim)?;
        self.expect_nl(sys)?;
        Ok(Stmt::Normal)
    }

    fn dim_const(&mut self, sys: &mut System) -> Result<i16, ParseError> {
        self.skip_space(sys);
        let mut text = String::new();
        while self.peek(0).is_ascii_digit() {
            if text.len() >= 8 {
                return Err(ParseError::DimInv);
            }
            text.push(self.peek(0) as char);
            self.advance(sys, 1);
        }
        if text.is_empty() {
            return Err(ParseError::DimInv);
        }
        let dim: i32 = text.parse().map_err(|_| ParseError::DimInv)?;
        if dim < 1 || dim as usize > STACK_SIZE {
            return Err(ParseError::DimInv);
        }
        Ok(dim as i16)
    }

    fn stmt_print(&mut self, sys: &mut System) -> Result<Stmt, ParseError> {
        let mut argc: i16 = 0;
        let mut semi;
        loop {
            self.expression(sys)?;
            argc += 1;
            semi = self.accept_ch(sys, b';');
            if !semi {
                break;
            }
            self.skip_space(sys);
            if self.peek(0) == b'\n' || self.at_end() {
                break;
            }
        }
        if !semi {
            // No trailing semicolon appends the host end-of-line string.
            let eol = sys.eol.clone();
            let start = sys.strings.set(&eol)?;
            self.emit(
                sys,
                Instr::Str {
                    start,
                    len: eol.len() as u16,
                },
            )?;
            argc += 1;
        }
        self.emit(sys, Instr::Print { argc: argc - 1 })?;
        self.expect_nl(sys)?;
        Ok(Stmt::Normal)
    }

    fn stmt_if(&mut self, sys: &mut System) -> Result<Stmt, ParseError> {
        self.expression(sys)?;
        if !self.accept_kw(sys, "then") {
            return Err(ParseError::ExpectedThen);
        }
        self.skip_space(sys);
        if self.peek(0) != b'\n' {
            // Single-line form: one statement, no ELSE.
            self.level += 1;
            let branch = self.emit(sys, Instr::If { target: 0 })?;
            match self.statement(sys)? {
                Stmt::Normal => {}
                _ => return Err(ParseError::ExpectedEndIf),
            }
            self.block_close(sys)?;
            self.level -= 1;
            let here = sys.code.next_index();
            self.patch(sys, branch, Instr::If { target: here })?;
            return Ok(Stmt::Normal);
        }
        self.advance(sys, 1); // the newline
        self.level += 1;
        let mut branch = Some(self.emit(sys, Instr::If { target: 0 })?);
        let mut end_patches: Vec<u16> = Vec::new();
        let mut seen_else = false;
        loop {
            match self.statement(sys)? {
                Stmt::Normal => {}
                Stmt::ElseIf => {
                    if seen_else {
                        return Err(ParseError::ExpectedEndIf);
                    }
                    self.block_close(sys)?;
                    end_patches.push(self.emit(sys, Instr::Goto { target: 0 })?);
                    let here = sys.code.next_index();
                    if let Some(at) = branch.take() {
                        self.patch(sys, at, Instr::If { target: here })?;
                    }
                    self.expression(sys)?;
                    if !self.accept_kw(sys, "then") {
                        return Err(ParseError::ExpectedThen);
                    }
                    self.expect_nl(sys)?;
                    branch = Some(self.emit(sys, Instr::If { target: 0 })?);
                }
                Stmt::Else => {
                    if seen_else {
                        return Err(ParseError::ExpectedEndIf);
                    }
                    seen_else = true;
                    self.block_close(sys)?;
                    end_patches.push(self.emit(sys, Instr::Goto { target: 0 })?);
                    let here = sys.code.next_index();
                    if let Some(at) = branch.take() {
                        self.patch(sys, at, Instr::If { target: here })?;
                    }
                    self.expect_nl(sys)?;
                }
                Stmt::EndIf => {
                    self.block_close(sys)?;
                    let here = sys.code.next_index();
                    if let Some(at) = branch.take() {
                        self.patch(sys, at, Instr::If { target: here })?;
                    }
                    for at in end_patches {
                        self.patch(sys, at, Instr::Goto { target: here })?;
                    }
                    self.level -= 1;
                    self.expect_nl(sys)?;
                    return Ok(Stmt::Normal);
                }
                _ => return Err(ParseError::ExpectedEndIf),
            }
        }
    }

    fn stmt_do(&mut self, sys: &mut System) -> Result<Stmt, ParseError> {
        self.level += 1;
        self.loops.push(LoopCtx {
            kind: LoopKind::Do,
            level: self.level,
            exit_label: None,
        });
        let head = sys.code.next_index();
        let mut head_branch = None;
        if self.accept_kw(sys, "while") {
            self.expression(sys)?;
            head_branch = Some(self.emit(sys, Instr::If { target: 0 })?);
        } else if self.accept_kw(sys, "until") {
            self.expression(sys)?;
            self.emit(sys, Instr::Not)?;
            head_branch = Some(self.emit(sys, Instr::If { target: 0 })?);
        }
        self.expect_nl(sys)?;
        loop {
            match self.statement(sys)? {
                Stmt::Normal => {}
                Stmt::LoopEnd => break,
                _ => return Err(ParseError::ExpectedLoop),
            }
        }
        // Per-iteration locals go before the loop is re-entered.
        self.block_close(sys)?;
        if self.accept_kw(sys, "while") {
            self.expression(sys)?;
            self.emit(sys, Instr::Not)?;
            self.emit(sys, Instr::If { target: head })?;
        } else if self.accept_kw(sys, "until") {
            self.expression(sys)?;
            self.emit(sys, Instr::If { target: head })?;
        } else {
            self.emit(sys, Instr::Goto { target: head })?;
        }
        self.expect_nl(sys)?;
        let here = sys.code.next_index();
        if let Some(at) = head_branch {
            self.patch(sys, at, Instr::If { target: here })?;
        }
        if let Some(ctx) = self.loops.pop()
            && let Some(li) = ctx.exit_label
        {
            self.labels[li as usize].dst = Some(here);
        }
        self.level -= 1;
        Ok(Stmt::Normal)
    }

    fn stmt_for(&mut self, sys: &mut System) -> Result<Stmt, ParseError> {
        // Control variable and the hidden limit and step slots live at
        // a level of their own around the body.
        self.level += 1;
        let Some(name) = self.take_name(sys)? else {
            return Err(ParseError::NameInv);
        };
        if !self.accept_ch(sys, b'=') {
            return Err(ParseError::ExpectedEq);
        }
        self.expression(sys)?;
        let ctl = self.add_var(name, 0)?;
        if !self.accept_kw(sys, "to") {
            return Err(ParseError::ExpectedTo);
        }
        self.expression(sys)?;
        let limit = self.add_hidden()?;
        if self.accept_kw(sys, "step") {
            self.expression(sys)?;
        } else {
            self.emit(sys, Instr::Int { value: 1 })?;
        }
        let step = self.add_hidden()?;
        self.expect_nl(sys)?;

        // (var - limit) * SIGN(step) <= 0 keeps looping for both step signs.
        let head = sys.code.next_index();
        self.emit_get(sys, &ctl)?;
        self.emit_get(sys, &limit)?;
        self.emit(sys, Instr::Minus)?;
        self.emit_get(sys, &step)?;
        self.emit(sys, Instr::Sign)?;
        self.emit(sys, Instr::Mult)?;
        self.emit(sys, Instr::Zero)?;
        self.emit(sys, Instr::Lteq)?;
        let head_branch = self.emit(sys, Instr::If { target: 0 })?;

        self.level += 1;
        self.loops.push(LoopCtx {
            kind: LoopKind::For,
            level: self.level,
            exit_label: None,
        });
        loop {
            match self.statement(sys)? {
                Stmt::Normal => {}
                Stmt::Next => break,
                _ => return Err(ParseError::ExpectedNext),
            }
        }
        self.block_close(sys)?;
        self.emit_get(sys, &ctl)?;
        self.emit_get(sys, &step)?;
        self.emit(sys, Instr::Plus)?;
        self.emit_let(sys, &ctl)?;
        self.emit(sys, Instr::Goto { target: head })?;
        self.expect_nl(sys)?;

        let here = sys.code.next_index();
        self.patch(sys, head_branch, Instr::If { target: here })?;
        if let Some(ctx) = self.loops.pop()
            && let Some(li) = ctx.exit_label
        {
            self.labels[li as usize].dst = Some(here);
        }
        self.level -= 1;
        self.block_close(sys)?; // control variable, limit, step
        self.level -= 1;
        Ok(Stmt::Normal)
    }

    fn stmt_sub(&mut self, sys: &mut System) -> Result<Stmt, ParseError> {
        if self.in_sub() {
            return Err(ParseError::SubNested);
        }
        let Some(name) = self.take_name(sys)? else {
            return Err(ParseError::NameInv);
        };
        if is_keyword(&name) {
            return Err(ParseError::NameKeyword);
        }
        if sys.find_service(&name).is_some() {
            return Err(ParseError::SvcNameClash);
        }
        let si = self.sub_index(&name)?;
        if self.subs[si].entry.is_some() {
            return Err(ParseError::SubDup);
        }
        if !self.accept_ch(sys, b'(') {
            return Err(ParseError::CallBrackets);
        }
        let mut params: Vec<(String, bool)> = Vec::new();
        if !self.accept_ch(sys, b')') {
            loop {
                let Some(param) = self.take_name(sys)? else {
                    return Err(ParseError::NameInv);
                };
                if is_keyword(&param) {
                    return Err(ParseError::NameKeyword);
                }
                if params.iter().any(|(p, _)| *p == param) {
                    return Err(ParseError::NameInv);
                }
                // "()" marks an array passed by reference.
                let by_ref = if self.accept_ch(sys, b'(') {
                    if !self.accept_ch(sys, b')') {
                        return Err(ParseError::BracketMissing);
                    }
                    true
                } else {
                    false
                };
                params.push((param, by_ref));
                if self.accept_ch(sys, b',') {
                    continue;
                }
                break;
            }
            if !self.accept_ch(sys, b')') {
                return Err(ParseError::BracketMissing);
            }
        }
        let argc = params.len() as i16;
        match self.subs[si].argc {
            Some(a) if a != argc => return Err(ParseError::ArgCount),
            None => self.subs[si].argc = Some(argc),
            _ => {}
        }
        self.expect_nl(sys)?;

        // Inline definition: straight-line flow jumps over the body.
        let skip = self.emit(sys, Instr::Goto { target: 0 })?;
        self.subs[si].entry = Some(sys.code.next_index());

        let saved_sp = self.sp;
        self.sp = 0;
        self.level += 1;
        let frame_level = self.level;
        if self.vars.len() + params.len() > MAX_VAR_NUM {
            return Err(ParseError::VarCount);
        }
        for (i, (param, by_ref)) in params.iter().enumerate() {
            self.vars.push(Var {
                name: param.clone(),
                index: i as i16 - argc,
                level: frame_level,
                dim: if *by_ref { -1 } else { 0 },
            });
        }
        self.sub_argc = Some(argc);

        loop {
            match self.statement(sys)? {
                Stmt::Normal => {}
                Stmt::EndSub => break,
                _ => return Err(ParseError::ExpectedEof),
            }
        }
        // Fall-through return hands back the ZERO the caller planted.
        self.emit(sys, Instr::Zero)?;
        self.emit(sys, Instr::Return { argc })?;

        while let Some(var) = self.vars.last() {
            if var.level < frame_level {
                break;
            }
            self.vars.pop();
        }
        self.sub_argc = None;
        self.level = frame_level - 1;
        self.sp = saved_sp;
        let here = sys.code.next_index();
        self.patch(sys, skip, Instr::Goto { target: here })?;
        self.expect_nl(sys)?;
        Ok(Stmt::Normal)
    }

    fn stmt_return(&mut self, sys: &mut System) -> Result<Stmt, ParseError> {
        let Some(argc) = self.sub_argc else {
            return Err(ParseError::ExitOutside);
        };
        self.expression(sys)?;
        self.emit(sys, Instr::Return { argc })?;
        self.expect_nl(sys)?;
        Ok(Stmt::Normal)
    }

    fn stmt_exit(&mut self, sys: &mut System) -> Result<Stmt, ParseError> {
        if self.accept_kw(sys, "sub") {
            let Some(argc) = self.sub_argc else {
                return Err(ParseError::ExitOutside);
            };
            self.emit(sys, Instr::Zero)?;
            self.emit(sys, Instr::Return { argc })?;
        } else if self.accept_kw(sys, "do") {
            self.exit_loop(sys, LoopKind::Do)?;
        } else if self.accept_kw(sys, "for") {
            self.exit_loop(sys, LoopKind::For)?;
        } else {
            return Err(ParseError::ExitOutside);
        }
        self.expect_nl(sys)?;
        Ok(Stmt::Normal)
    }

    fn exit_loop(&mut self, sys: &mut System, kind: LoopKind) -> Result<(), ParseError> {
        let Some(pos) = self.loops.iter().rposition(|c| c.kind == kind) else {
            return Err(ParseError::ExitOutside);
        };
        let ctx_level = self.loops[pos].level;
        let slots: i32 = self
            .vars
            .iter()
            .filter(|v| v.level >= ctx_level)
            .map(Var::slots)
            .sum();
        if slots > 0 {
            self.emit(
                sys,
                Instr::Pop {
                    count: (slots - 1) as i16,
                },
            )?;
            // The POP runs only on the jump path, the variables stay
            // live for the rest of the block.
            self.sp += slots;
        }
        let li = match self.loops[pos].exit_label {
            Some(li) => li,
            None => {
                let li = self.synthetic_label()? as i16;
                self.loops[pos].exit_label = Some(li);
                li
            }
        };
        self.emit(sys, Instr::LnkGoto { label: li })?;
        Ok(())
    }

    fn stmt_goto(&mut self, sys: &mut System) -> Result<Stmt, ParseError> {
        let Some(name) = self.take_name(sys)? else {
            return Err(ParseError::NameInv);
        };
        let li = self.label_index(&name)?;
        self.emit(sys, Instr::LnkGoto { label: li as i16 })?;
        self.expect_nl(sys)?;
        Ok(Stmt::Normal)
    }

    fn stmt_option(&mut self, sys: &mut System) -> Result<Stmt, ParseError> {
        if !self.accept_kw(sys, "explicit") {
            return Err(ParseError::NameInv);
        }
        if self.accept_kw(sys, "off") {
            self.explicit = false;
        } else {
            let _ = self.accept_kw(sys, "on");
            self.explicit = true;
        }
        self.expect_nl(sys)?;
        Ok(Stmt::Normal)
    }

    // ---- calls ------------------------------------------------------

    fn arg_list(&mut self, sys: &mut System) -> Result<i16, ParseError> {
        if self.accept_ch(sys, b')') {
            return Ok(0);
        }
        let mut n: i16 = 0;
        loop {
            self.expression(sys)?;
            n += 1;
            if self.accept_ch(sys, b',') {
                continue;
            }
            break;
        }
        if !self.accept_ch(sys, b')') {
            return Err(ParseError::BracketMissing);
        }
        Ok(n)
    }

    /// Return slot, arguments, GOSUB placeholder. Statically the whole
    /// call leaves exactly the return slot behind.
    fn call_sub(&mut self, sys: &mut System, name: &str) -> Result<(), ParseError> {
        let si = self.sub_index(name)?;
        let sp0 = self.sp;
        self.emit(sys, Instr::Zero)?;
        let mut argc: i16 = 0;
        if self.accept_ch(sys, b'(') {
            argc = self.arg_list(sys)?;
        }
        match self.subs[si].argc {
            Some(a) if a != argc => return Err(ParseError::ArgCount),
            None => self.subs[si].argc = Some(argc),
            _ => {}
        }
        self.emit(sys, Instr::LnkGosub { sub: si as i16 })?;
        self.sp = sp0 + 1;
        Ok(())
    }

    /// Arguments, then the return slot on top, then SVC.
    fn call_service(&mut self, sys: &mut System, idx: i16, argc: i16) -> Result<(), ParseError> {
        let sp0 = self.sp;
        if !self.accept_ch(sys, b'(') {
            return Err(ParseError::CallBrackets);
        }
        let n = self.arg_list(sys)?;
        if n != argc {
            return Err(ParseError::ArgCount);
        }
        self.emit(sys, Instr::Zero)?;
        self.emit(sys, Instr::Svc { index: idx })?;
        self.sp = sp0 + 1;
        Ok(())
    }

    // ---- expressions ------------------------------------------------
    //
    // Precedence, loosest first: XOR, OR, AND, NOT, comparisons,
    // shifts, additive, multiplicative, power, unary minus, atoms.

    fn expression(&mut self, sys: &mut System) -> Result<(), ParseError> {
        self.expr_xor(sys)
    }

    fn expr_xor(&mut self, sys: &mut System) -> Result<(), ParseError> {
        self.expr_or(sys)?;
        while self.accept_kw(sys, "xor") {
            self.expr_or(sys)?;
            self.emit(sys, Instr::Xor)?;
        }
        Ok(())
    }

    fn expr_or(&mut self, sys: &mut System) -> Result<(), ParseError> {
        self.expr_and(sys)?;
        while self.accept_kw(sys, "or") {
            self.expr_and(sys)?;
            self.emit(sys, Instr::Or)?;
        }
        Ok(())
    }

    fn expr_and(&mut self, sys: &mut System) -> Result<(), ParseError> {
        self.expr_not(sys)?;
        while self.accept_kw(sys, "and") {
            self.expr_not(sys)?;
            self.emit(sys, Instr::And)?;
        }
        Ok(())
    }

    fn expr_not(&mut self, sys: &mut System) -> Result<(), ParseError> {
        if self.accept_kw(sys, "not") {
            self.expr_not(sys)?;
            self.emit(sys, Instr::Not)?;
            return Ok(());
        }
        self.expr_cmp(sys)
    }

    fn expr_cmp(&mut self, sys: &mut System) -> Result<(), ParseError> {
        self.expr_shift(sys)?;
        loop {
            if self.accept_sym(sys, "<>") {
                self.expr_shift(sys)?;
                self.emit(sys, Instr::Neq)?;
                continue;
            }
            if self.accept_sym(sys, "<=") {
                self.expr_shift(sys)?;
                self.emit(sys, Instr::Lteq)?;
                continue;
            }
            if self.accept_sym(sys, ">=") {
                self.expr_shift(sys)?;
                self.emit(sys, Instr::Gteq)?;
                continue;
            }
            self.skip_space(sys);
            if self.peek(0) == b'<' && self.peek(1) != b'<' {
                self.advance(sys, 1);
                self.expr_shift(sys)?;
                self.emit(sys, Instr::Lt)?;
                continue;
            }
            if self.peek(0) == b'>' && self.peek(1) != b'>' {
                self.advance(sys, 1);
                self.expr_shift(sys)?;
                self.emit(sys, Instr::Gt)?;
                continue;
            }
            if self.accept_sym(sys, "=") {
                self.expr_shift(sys)?;
                self.emit(sys, Instr::Equal)?;
                continue;
            }
            return Ok(());
        }
    }

    fn expr_shift(&mut self, sys: &mut System) -> Result<(), ParseError> {
        self.expr_add(sys)?;
        loop {
            if self.accept_sym(sys, "<<") {
                self.expr_add(sys)?;
                self.emit(sys, Instr::Shl)?;
                continue;
            }
            if self.accept_sym(sys, ">>") {
                self.expr_add(sys)?;
                self.emit(sys, Instr::Shr)?;
                continue;
            }
            return Ok(());
        }
    }

    fn expr_add(&mut self, sys: &mut System) -> Result<(), ParseError> {
        self.expr_mul(sys)?;
        loop {
            if self.accept_ch(sys, b'+') {
                self.expr_mul(sys)?;
                self.emit(sys, Instr::Plus)?;
                continue;
            }
            if self.accept_ch(sys, b'-') {
                self.expr_mul(sys)?;
                self.emit(sys, Instr::Minus)?;
                continue;
            }
            return Ok(());
        }
    }

    fn expr_mul(&mut self, sys: &mut System) -> Result<(), ParseError> {
        self.expr_pow(sys)?;
        loop {
            if self.accept_kw(sys, "mod") {
                self.expr_pow(sys)?;
                self.emit(sys, Instr::Mod)?;
                continue;
            }
            if self.accept_ch(sys, b'*') {
                self.expr_pow(sys)?;
                self.emit(sys, Instr::Mult)?;
                continue;
            }
            if self.accept_ch(sys, b'/') {
                self.expr_pow(sys)?;
                self.emit(sys, Instr::Div)?;
                continue;
            }
            if self.accept_ch(sys, b'\\') {
                self.expr_pow(sys)?;
                self.emit(sys, Instr::IDiv)?;
                continue;
            }
            return Ok(());
        }
    }

    fn expr_pow(&mut self, sys: &mut System) -> Result<(), ParseError> {
        self.expr_unary(sys)?;
        while self.accept_ch(sys, b'^') {
            self.expr_unary(sys)?;
            self.emit(sys, Instr::Pow)?;
        }
        Ok(())
    }

    fn expr_unary(&mut self, sys: &mut System) -> Result<(), ParseError> {
        self.skip_space(sys);
        if self.peek(0) == b'-' {
            self.advance(sys, 1);
            // 0 - x, there is no dedicated negation opcode.
            self.emit(sys, Instr::Zero)?;
            self.expr_unary(sys)?;
            self.emit(sys, Instr::Minus)?;
            return Ok(());
        }
        self.atom(sys)
    }

    fn atom(&mut self, sys: &mut System) -> Result<(), ParseError> {
        if self.accept_kw(sys, "true") {
            self.emit(sys, Instr::Int { value: -1 })?;
            return Ok(());
        }
        if self.accept_kw(sys, "false") {
            self.emit(sys, Instr::Zero)?;
            return Ok(());
        }
        if self.accept_ch(sys, b'(') {
            self.expression(sys)?;
            if !self.accept_ch(sys, b')') {
                return Err(ParseError::BracketMissing);
            }
            return Ok(());
        }
        self.skip_space(sys);
        let c = self.peek(0);
        if c == b'"' {
            return self.string_literal(sys);
        }
        if c.is_ascii_digit()
            || (c == b'.' && self.peek(1).is_ascii_digit())
            || (c == b'&' && (self.peek(1) == b'H' || self.peek(1) == b'h'))
        {
            return self.number(sys);
        }
        if self.accept_ch(sys, b'$') {
            let Some(name) = self.take_name(sys)? else {
                return Err(ParseError::NameInv);
            };
            let Some(reg) = sys.find_register(&name) else {
                return Err(ParseError::RegNotFound);
            };
            self.emit(sys, Instr::GetReg { reg })?;
            return Ok(());
        }
        if let Some(name) = self.take_name(sys)? {
            if is_keyword(&name) {
                return Err(ParseError::ExpectedExpr);
            }
            return self.name_atom(sys, name);
        }
        Err(ParseError::ExpectedExpr)
    }

    fn name_atom(&mut self, sys: &mut System, name: String) -> Result<(), ParseError> {
        if let Some(var) = self.get_var(&name) {
            if var.dim == 0 {
                self.skip_space(sys);
                if self.peek(0) == b'(' {
                    return Err(ParseError::NotAnArray);
                }
                self.emit_get(sys, &var)?;
                return Ok(());
            }
            if self.accept_ch(sys, b'(') {
                self.expression(sys)?; // index
                if !self.accept_ch(sys, b')') {
                    return Err(ParseError::BracketMissing);
                }
                let instr = if var.dim < 0 {
                    Instr::GetPtr { index: var.index }
                } else if var.level == 0 {
                    Instr::GetGlobal {
                        index: var.index,
                        dim: var.dim,
                    }
                } else {
                    Instr::GetLocal {
                        index: var.index,
                        dim: var.dim,
                    }
                };
                self.emit(sys, instr)?;
                return Ok(());
            }
            // Bare array name materialises a pointer to its first slot.
            if var.level == 0 {
                self.emit(
                    sys,
                    Instr::Ptr {
                        index: var.index as u16,
                        dim: var.dim as u16,
                    },
                )?;
            } else {
                self.emit(
                    sys,
                    Instr::CreatePtr {
                        index: var.index,
                        dim: if var.dim > 0 { var.dim } else { 0 },
                    },
                )?;
            }
            return Ok(());
        }
        if let Some((idx, argc)) = sys.find_service(&name) {
            return self.call_service(sys, idx, argc);
        }
        self.skip_space(sys);
        if self.peek(0) == b'(' {
            return self.call_sub(sys, &name);
        }
        Err(ParseError::VarUndefined)
    }

    fn string_literal(&mut self, sys: &mut System) -> Result<(), ParseError> {
        self.advance(sys, 1); // opening quote
        let mut bytes = Vec::new();
        loop {
            if self.at_end() {
                return Err(ParseError::StringInv);
            }
            let c = self.peek(0);
            if c == b'"' {
                self.advance(sys, 1);
                break;
            }
            if c == b'\n' {
                return Err(ParseError::StringInv);
            }
            bytes.push(c);
            self.advance(sys, 1);
        }
        if bytes.len() > u16::MAX as usize {
            return Err(ParseError::StringLength);
        }
        let start = sys.strings.set(&bytes)?;
        self.emit(
            sys,
            Instr::Str {
                start,
                len: bytes.len() as u16,
            },
        )?;
        Ok(())
    }

    fn number(&mut self, sys: &mut System) -> Result<(), ParseError> {
        // Hex: 0x.. or &H..
        if (self.peek(0) == b'0' && (self.peek(1) == b'x' || self.peek(1) == b'X'))
            || (self.peek(0) == b'&' && (self.peek(1) == b'H' || self.peek(1) == b'h'))
        {
            self.advance(sys, 2);
            let mut text = String::new();
            while self.peek(0).is_ascii_hexdigit() {
                if text.len() >= 8 {
                    return Err(ParseError::NumberInv);
                }
                text.push(self.peek(0) as char);
                self.advance(sys, 1);
            }
            if text.is_empty() {
                return Err(ParseError::NumberInv);
            }
            let value = u32::from_str_radix(&text, 16).map_err(|_| ParseError::NumberInv)? as i32;
            return self.emit_int(sys, value);
        }

        let mut text = String::new();
        let mut is_float = false;
        while self.peek(0).is_ascii_digit() {
            if text.len() >= 32 {
                return Err(ParseError::NumberInv);
            }
            text.push(self.peek(0) as char);
            self.advance(sys, 1);
        }
        if self.peek(0) == b'.' {
            is_float = true;
            text.push('.');
            self.advance(sys, 1);
            while self.peek(0).is_ascii_digit() {
                if text.len() >= 32 {
                    return Err(ParseError::NumberInv);
                }
                text.push(self.peek(0) as char);
                self.advance(sys, 1);
            }
        }
        if self.peek(0) == b'e' || self.peek(0) == b'E' {
            is_float = true;
            text.push('e');
            self.advance(sys, 1);
            if self.peek(0) == b'+' || self.peek(0) == b'-' {
                text.push(self.peek(0) as char);
                self.advance(sys, 1);
            }
            let mut digits = 0;
            while self.peek(0).is_ascii_digit() {
                if text.len() >= 32 {
                    return Err(ParseError::NumberInv);
                }
                text.push(self.peek(0) as char);
                self.advance(sys, 1);
                digits += 1;
            }
            if digits == 0 {
                return Err(ParseError::NumberInv);
            }
        }
        if text.is_empty() || text == "." {
            return Err(ParseError::NumberInv);
        }
        if is_float {
            let value: f32 = text.parse().map_err(|_| ParseError::NumberInv)?;
            self.emit(sys, Instr::Float { value })?;
            return Ok(());
        }
        let value: i32 = text.parse().map_err(|_| ParseError::NumberInv)?;
        self.emit_int(sys, value)
    }

    fn emit_int(&mut self, sys: &mut System, value: i32) -> Result<(), ParseError> {
        if value == 0 {
            self.emit(sys, Instr::Zero)?;
        } else {
            self.emit(sys, Instr::Int { value })?;
        }
        Ok(())
    }
}

impl Default for Parser {
    fn default() -> Self {
        Parser::new()
    }
}

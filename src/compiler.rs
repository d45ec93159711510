// I found https://matklad.github.io/2020/04/13/simple-but-powerful-pratt-parsing.html
// to e a very helpful guide to writing a Pratt parser in Rust.

use std::fmt::Display;

use thiserror::Error;

use crate::{
    scanner::{Literal, Token, TokenType},
    vm::{object::Function, Chunk, Handle, Heap, Instruction, Value},
};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_ARGS: usize = 255;

/// Where in the source a compile error was reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorLocation {
    /// At a token, holding its lexeme.
    Token(String),
    /// At the end of input.
    End,
    /// The scanner rejected the input; its message says where.
    Scanner,
}

/// One compile error, formatted like `[line 1] Error at 'x': Expect expression.`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct CompileError {
    /// Source line of the offending token.
    pub line: usize,
    /// Which token, if any, the error points at.
    pub location: ErrorLocation,
    /// The message alone, without the line/location prefix.
    pub message: String,
}

impl CompileError {
    fn at(token: &Token<'_>, message: &str) -> CompileError {
        let location = match token.typ() {
            TokenType::Eof => ErrorLocation::End,
            TokenType::Error => ErrorLocation::Scanner,
            _ => ErrorLocation::Token(token.lexeme().to_string()),
        };
        CompileError {
            line: token.line(),
            location,
            message: message.to_string(),
        }
    }
}

impl Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.location {
            ErrorLocation::Token(lexeme) => write!(f, " at '{}'", lexeme)?,
            ErrorLocation::End => write!(f, " at end")?,
            ErrorLocation::Scanner => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// Every error reported while compiling, in source order. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct CompileErrors(pub Vec<CompileError>);

impl Display for CompileErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for error in &self.0 {
            if !first {
                writeln!(f)?;
            }
            first = false;
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

mod precedence {
    // The book uses a C enum. The key, really, is a comparable enum, thus we derive Ord.
    // The book also uses an array indexed by the enums, but that's really just a match statement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    pub enum Precedence {
        Bottom,
        Assignment,
        Or,
        And,
        Equality,
        Comparison,
        Term,
        Factor,
        Unary,
        Call,
        Primary,
    }
    use Precedence::*;

    impl Precedence {
        pub fn next(&self) -> Precedence {
            match self {
                Bottom => Assignment,
                Assignment => Or,
                Or => And,
                And => Equality,
                Equality => Comparison,
                Comparison => Term,
                Term => Factor,
                Factor => Unary,
                Unary => Call,
                Call => Primary,
                Primary => Primary,
            }
        }
    }
}

use precedence::Precedence;

type ParseFn<P> = fn(&mut P, bool);

struct ParseRule<P> {
    prefix: Option<ParseFn<P>>,
    infix: Option<ParseFn<P>>,
    precedence: Precedence,
}

impl<P> ParseRule<P> {
    fn new(prefix: Option<ParseFn<P>>, infix: Option<ParseFn<P>>, precedence: Precedence) -> Self {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

#[derive(Debug)]
struct Local {
    name: String,
    // None between declaration and the end of the initializer.
    depth: Option<usize>,
    is_captured: bool,
}

// How a name resolved.
enum Variable {
    Local(u8),
    Upvalue(u8),
    Global(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueRef {
    index: u8,
    is_local: bool,
}

// Per-function compilation state. One of these per function being compiled, innermost last.
#[derive(Debug)]
struct FunctionCompiler {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: usize,
}

impl FunctionCompiler {
    fn new(kind: FunctionKind, name: Option<Handle>) -> FunctionCompiler {
        FunctionCompiler {
            function: Function {
                arity: 0,
                upvalue_count: 0,
                chunk: Chunk::new(),
                name,
            },
            kind,
            // Slot zero holds the callee. The empty name keeps user code from referring to it.
            locals: vec![Local {
                name: String::new(),
                depth: Some(0),
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

// Parser takes a source of tokens, and spits out a function.
// Errors are collected rather than printed. The public API for Parser is the compile() function.
#[derive(Debug)]
struct Parser<'a, 'h, T> {
    tokens: T,
    previous: Token<'a>,
    current: Token<'a>,
    frame: FunctionCompiler,
    enclosing: Vec<FunctionCompiler>,
    errors: Vec<CompileError>,
    panic_mode: bool,
    heap: &'h mut Heap,
}

impl<'a, 'h, T> Parser<'a, 'h, T>
where
    T: Iterator<Item = Token<'a>>,
{
    fn new(tokens: T, heap: &'h mut Heap) -> Self {
        Parser {
            tokens,
            previous: Token::new(TokenType::Eof, "", 1),
            current: Token::new(TokenType::Eof, "", 1),
            frame: FunctionCompiler::new(FunctionKind::Script, None),
            enclosing: Vec::new(),
            errors: Vec::new(),
            panic_mode: false,
            heap,
        }
    }

    fn rule(typ: TokenType) -> ParseRule<Self> {
        use TokenType::*;
        match typ {
            LeftParen => ParseRule::new(Some(Self::grouping), Some(Self::call), Precedence::Call),
            Minus => ParseRule::new(Some(Self::unary), Some(Self::binary), Precedence::Term),
            Plus => ParseRule::new(None, Some(Self::binary), Precedence::Term),
            Slash | Star => ParseRule::new(None, Some(Self::binary), Precedence::Factor),
            Bang => ParseRule::new(Some(Self::unary), None, Precedence::Bottom),
            BangEqual | EqualEqual => {
                ParseRule::new(None, Some(Self::binary), Precedence::Equality)
            }
            Greater | GreaterEqual | Less | LessEqual => {
                ParseRule::new(None, Some(Self::binary), Precedence::Comparison)
            }
            Identifier => ParseRule::new(Some(Self::variable), None, Precedence::Bottom),
            String => ParseRule::new(Some(Self::string), None, Precedence::Bottom),
            Number => ParseRule::new(Some(Self::number), None, Precedence::Bottom),
            And => ParseRule::new(None, Some(Self::and), Precedence::And),
            Or => ParseRule::new(None, Some(Self::or), Precedence::Or),
            False | True | Nil => ParseRule::new(Some(Self::literal), None, Precedence::Bottom),
            _ => ParseRule::new(None, None, Precedence::Bottom),
        }
    }

    // ---- token handling ----

    fn advance(&mut self) {
        let line = self.current.line();
        let next = self
            .tokens
            .next()
            .unwrap_or_else(|| Token::new(TokenType::Eof, "", line));
        self.previous = std::mem::replace(&mut self.current, next);
        while self.current.typ() == TokenType::Error {
            let message = self.current.lexeme().to_string();
            self.error_at_current(&message);
            let line = self.current.line();
            self.current = self
                .tokens
                .next()
                .unwrap_or_else(|| Token::new(TokenType::Eof, "", line));
        }
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ() == typ
    }

    fn match_token(&mut self, typ: TokenType) -> bool {
        if !self.check(typ) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, expected_type: TokenType, message_if_missing: &str) {
        if self.check(expected_type) {
            self.advance();
        } else {
            self.error_at_current(message_if_missing);
        }
    }

    // ---- errors ----

    fn error(&mut self, message: &str) {
        let error = CompileError::at(&self.previous, message);
        self.report(error);
    }

    fn error_at_current(&mut self, message: &str) {
        let error = CompileError::at(&self.current, message);
        self.report(error);
    }

    fn report(&mut self, error: CompileError) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        tracing::debug!(%error, "compile error");
        self.errors.push(error);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenType::Eof) {
            if self.previous.typ() == TokenType::Semicolon {
                return;
            }
            match self.current.typ() {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => self.advance(),
            }
        }
    }

    // ---- emitting ----

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.frame.function.chunk
    }

    fn write_instruction(&mut self, instruction: Instruction) {
        let line = self.previous.line();
        self.chunk().write_instruction(instruction, line)
    }

    fn write_byte(&mut self, byte: u8) {
        let line = self.previous.line();
        self.chunk().write_byte(byte, line)
    }

    fn emit_return(&mut self) {
        self.write_instruction(Instruction::Nil);
        self.write_instruction(Instruction::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let idx = self.chunk().add_constant(value);
        match u8::try_from(idx) {
            Ok(idx) => idx,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.write_instruction(Instruction::Constant(idx));
    }

    // Emit a forward jump with a placeholder offset, returning where the offset lives.
    fn emit_jump(&mut self, instruction: fn(u16) -> Instruction) -> usize {
        self.write_instruction(instruction(u16::MAX));
        self.chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 for the offset bytes themselves.
        let jump = self.chunk().len() - offset - 2;
        match u16::try_from(jump) {
            Ok(jump) => self.chunk().patch_u16(offset, jump),
            Err(_) => self.error("Too much code to jump over."),
        }
    }

    fn emit_loop(&mut self, loop_start: usize) {
        // +3 to also jump back over the Loop instruction itself.
        let offset = self.chunk().len() - loop_start + 3;
        match u16::try_from(offset) {
            Ok(offset) => self.write_instruction(Instruction::Loop(offset)),
            Err(_) => {
                self.error("Loop body too large.");
                self.write_instruction(Instruction::Loop(0));
            }
        }
    }

    // ---- functions ----

    fn end_compiler(&mut self) {
        self.emit_return();
        self.frame.function.upvalue_count = self.frame.upvalues.len();
        #[cfg(feature = "print-code")]
        self.log_code();
    }

    #[cfg(feature = "print-code")]
    fn log_code(&self) {
        if !self.errors.is_empty() {
            return;
        }
        let name = match self.frame.function.name {
            Some(name) => self.heap.string(name).unwrap_or("<fn>"),
            None => "<script>",
        };
        tracing::debug!("\n{}", self.frame.function.chunk.disassemble(name, self.heap));
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.previous.lexeme());
        let outer = std::mem::replace(&mut self.frame, FunctionCompiler::new(kind, Some(name)));
        self.enclosing.push(outer);
        self.begin_scope();

        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                self.frame.function.arity += 1;
                if self.frame.function.arity > MAX_ARGS {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        // No end_scope: the locals go away with the frame when it returns.
        self.end_compiler();
        let Some(outer) = self.enclosing.pop() else {
            return;
        };
        let compiled = std::mem::replace(&mut self.frame, outer);
        let handle = self.heap.new_function(compiled.function);
        let idx = self.make_constant(Value::Object(handle));
        self.write_instruction(Instruction::Closure(idx));
        for upvalue in compiled.upvalues {
            self.write_byte(u8::from(upvalue.is_local));
            self.write_byte(upvalue.index);
        }
    }

    // ---- declarations and statements ----

    fn declaration(&mut self) {
        if self.match_token(TokenType::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        // A function may refer to itself, so it's initialized before its body is compiled.
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.write_instruction(Instruction::Nil);
        }
        self.consume(
            TokenType::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::Print) {
            self.print_statement();
        } else if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.write_instruction(Instruction::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.write_instruction(Instruction::Pop);
    }

    fn return_statement(&mut self) {
        if self.frame.kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.write_instruction(Instruction::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Instruction::JumpIfFalse);
        self.write_instruction(Instruction::Pop);
        self.statement();
        let else_jump = self.emit_jump(Instruction::Jump);

        self.patch_jump(then_jump);
        self.write_instruction(Instruction::Pop);
        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.chunk().len();
        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Instruction::JumpIfFalse);
        self.write_instruction(Instruction::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.write_instruction(Instruction::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenType::Semicolon) {
            // No initializer.
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().len();
        let mut exit_jump = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Instruction::JumpIfFalse));
            self.write_instruction(Instruction::Pop);
        }

        if !self.match_token(TokenType::RightParen) {
            // The increment runs after the body, so jump over it now and loop back to it later.
            let body_jump = self.emit_jump(Instruction::Jump);
            let increment_start = self.chunk().len();
            self.expression();
            self.write_instruction(Instruction::Pop);
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.write_instruction(Instruction::Pop);
        }
        self.end_scope();
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn begin_scope(&mut self) {
        self.frame.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.frame.scope_depth -= 1;
        while let Some(local) = self.frame.locals.last() {
            if local.depth.map_or(true, |d| d <= self.frame.scope_depth) {
                break;
            }
            let instruction = if local.is_captured {
                Instruction::CloseUpvalue
            } else {
                Instruction::Pop
            };
            self.write_instruction(instruction);
            self.frame.locals.pop();
        }
    }

    // ---- variables ----

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.heap.intern(name);
        self.make_constant(Value::Object(handle))
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);
        self.declare_variable();
        if self.frame.scope_depth > 0 {
            return 0;
        }
        let name = self.previous.lexeme().to_string();
        self.identifier_constant(&name)
    }

    fn declare_variable(&mut self) {
        if self.frame.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme().to_string();
        let scope_depth = self.frame.scope_depth;
        let duplicate = self
            .frame
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth.map_or(true, |d| d >= scope_depth))
            .any(|local| local.name == name);
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn add_local(&mut self, name: String) {
        if self.frame.locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.frame.locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    fn mark_initialized(&mut self) {
        let scope_depth = self.frame.scope_depth;
        if scope_depth == 0 {
            return;
        }
        if let Some(local) = self.frame.locals.last_mut() {
            local.depth = Some(scope_depth);
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.frame.scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.write_instruction(Instruction::DefineGlobal(global));
    }

    // `depth` indexes the function stack: enclosing[0] is the script, and enclosing.len() is the
    // function currently being compiled.
    fn frame_at(&mut self, depth: usize) -> &mut FunctionCompiler {
        if depth == self.enclosing.len() {
            &mut self.frame
        } else {
            &mut self.enclosing[depth]
        }
    }

    fn resolve_local(&mut self, depth: usize, name: &str) -> Option<u8> {
        let (slot, initialized) = self
            .frame_at(depth)
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(slot, local)| (slot, local.depth.is_some()))?;
        if !initialized {
            self.error("Can't read local variable in its own initializer.");
        }
        // There are at most MAX_LOCALS slots, so this always fits.
        u8::try_from(slot).ok()
    }

    fn resolve_upvalue(&mut self, depth: usize, name: &str) -> Option<u8> {
        let enclosing = depth.checked_sub(1)?;
        if let Some(slot) = self.resolve_local(enclosing, name) {
            self.frame_at(enclosing).locals[usize::from(slot)].is_captured = true;
            return Some(self.add_upvalue(depth, slot, true));
        }
        let index = self.resolve_upvalue(enclosing, name)?;
        Some(self.add_upvalue(depth, index, false))
    }

    fn add_upvalue(&mut self, depth: usize, index: u8, is_local: bool) -> u8 {
        let upvalue = UpvalueRef { index, is_local };
        let upvalues = &mut self.frame_at(depth).upvalues;
        if let Some(existing) = upvalues.iter().position(|u| *u == upvalue) {
            return existing as u8;
        }
        if upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        upvalues.push(upvalue);
        (upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let depth = self.enclosing.len();
        let target = if let Some(slot) = self.resolve_local(depth, name) {
            Variable::Local(slot)
        } else if let Some(index) = self.resolve_upvalue(depth, name) {
            Variable::Upvalue(index)
        } else {
            Variable::Global(self.identifier_constant(name))
        };
        let (get, set) = match target {
            Variable::Local(slot) => (Instruction::GetLocal(slot), Instruction::SetLocal(slot)),
            Variable::Upvalue(idx) => (Instruction::GetUpvalue(idx), Instruction::SetUpvalue(idx)),
            Variable::Global(idx) => (Instruction::GetGlobal(idx), Instruction::SetGlobal(idx)),
        };

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.write_instruction(set);
        } else {
            self.write_instruction(get);
        }
    }

    // ---- expressions ----

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    // The contract of this function is to consume an expression and emit bytecode to the chunk
    // such that the bytecode is a stack-ified verrsion of the expression e.g.
    // if the tokens are 1 + 2, it should emit two constant instructions then an add.
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.typ()).prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.typ()).precedence {
            self.advance();
            if let Some(infix) = Self::rule(self.previous.typ()).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, _can_assign: bool) {
        match self.previous.literal() {
            Some(Literal::Number(n)) => self.emit_constant(Value::Number(n)),
            _ => self.error("Invalid number literal."),
        }
    }

    fn string(&mut self, _can_assign: bool) {
        let handle = match self.previous.literal() {
            Some(Literal::String(s)) => self.heap.intern(s),
            _ => return self.error("Invalid string literal."),
        };
        self.emit_constant(Value::Object(handle));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.typ() {
            TokenType::False => self.write_instruction(Instruction::False),
            TokenType::True => self.write_instruction(Instruction::True),
            TokenType::Nil => self.write_instruction(Instruction::Nil),
            _ => {}
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme().to_string();
        self.named_variable(&name, can_assign);
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.typ();
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenType::Minus => self.write_instruction(Instruction::Negate),
            TokenType::Bang => self.write_instruction(Instruction::Not),
            _ => {}
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.typ();
        let precedence = Self::rule(operator).precedence;
        self.parse_precedence(precedence.next());

        let instructions: &[Instruction] = match operator {
            TokenType::Plus => &[Instruction::Add],
            TokenType::Minus => &[Instruction::Subtract],
            TokenType::Star => &[Instruction::Multiply],
            TokenType::Slash => &[Instruction::Divide],
            TokenType::EqualEqual => &[Instruction::Equal],
            TokenType::BangEqual => &[Instruction::Equal, Instruction::Not],
            TokenType::Greater => &[Instruction::Greater],
            TokenType::GreaterEqual => &[Instruction::Less, Instruction::Not],
            TokenType::Less => &[Instruction::Less],
            TokenType::LessEqual => &[Instruction::Greater, Instruction::Not],
            _ => &[],
        };
        for &instruction in instructions {
            self.write_instruction(instruction);
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(Instruction::JumpIfFalse);
        self.write_instruction(Instruction::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(Instruction::JumpIfFalse);
        let end_jump = self.emit_jump(Instruction::Jump);
        self.patch_jump(else_jump);
        self.write_instruction(Instruction::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.write_instruction(Instruction::Call(arg_count));
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: usize = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if count == MAX_ARGS {
                    self.error("Can't have more than 255 arguments.");
                }
                count += 1;
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        u8::try_from(count).unwrap_or(u8::MAX)
    }
}

/// Compile a stream of tokens into the top-level script function, allocated on `heap`.
///
/// Compilation carries on past errors, resynchronizing at statement boundaries, so that one call
/// reports as many errors as it can.
pub fn compile<'a, T>(tokens: T, heap: &mut Heap) -> Result<Handle, CompileErrors>
where
    T: IntoIterator<Item = Token<'a>>,
{
    let mut parser = Parser::new(tokens.into_iter(), heap);
    parser.advance();
    while !parser.match_token(TokenType::Eof) {
        parser.declaration();
    }
    parser.end_compiler();

    if !parser.errors.is_empty() {
        return Err(CompileErrors(parser.errors));
    }
    Ok(parser.heap.new_function(parser.frame.function))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::scanner::Scanner;
    use pretty_assertions::assert_eq;

    fn compile_source(text: &str) -> (Heap, Result<Handle, CompileErrors>) {
        let mut heap = Heap::new();
        let result = compile(Scanner::new(text), &mut heap);
        (heap, result)
    }

    fn errors(text: &str) -> Vec<String> {
        match compile_source(text).1 {
            Ok(_) => panic!("expected {:?} to fail to compile", text),
            Err(CompileErrors(errors)) => errors.iter().map(|e| e.to_string()).collect(),
        }
    }

    // Decodes a chunk without closures in it.
    fn instructions(chunk: &Chunk) -> Vec<Instruction> {
        let mut offset = 0;
        let mut ret = Vec::new();
        while let Some((instruction, len)) = chunk.instruction_at(offset) {
            ret.push(instruction);
            offset += len;
        }
        ret
    }

    #[test]
    fn expression_statement_bytecode() {
        let (heap, result) = compile_source("print (1 + 3) / -(2 >= 1);");
        let script = heap.function(result.unwrap()).unwrap();
        use Instruction::*;
        assert_eq!(
            instructions(&script.chunk),
            vec![
                Constant(0),
                Constant(1),
                Add,
                Constant(2),
                Constant(3),
                Less,
                Not,
                Negate,
                Divide,
                Print,
                Nil,
                Return
            ]
        );
        assert_eq!(script.arity, 0);
        assert_eq!(script.name, None);
    }

    #[test]
    fn locals_use_slots() {
        let (heap, result) = compile_source("{ var a = 1; var b = a; b = 2; }");
        let script = heap.function(result.unwrap()).unwrap();
        use Instruction::*;
        assert_eq!(
            instructions(&script.chunk),
            vec![
                Constant(0),
                GetLocal(1),
                Constant(1),
                SetLocal(2),
                Pop,
                Pop,
                Pop,
                Nil,
                Return
            ]
        );
    }

    #[test]
    fn error_locations() {
        assert_eq!(
            errors("var 1 = 2;"),
            vec!["[line 1] Error at '1': Expect variable name."]
        );
        assert_eq!(
            errors("print 1"),
            vec!["[line 1] Error at end: Expect ';' after value."]
        );
        assert_eq!(
            errors("print @;"),
            vec!["[line 1] Error: Unexpected character '@'."]
        );
        assert_eq!(
            errors("1 = 2;"),
            vec!["[line 1] Error at '=': Invalid assignment target."]
        );
    }

    #[test]
    fn recovers_at_statement_boundaries() {
        assert_eq!(
            errors("var 1;\nprint 2;\nvar 3;"),
            vec![
                "[line 1] Error at '1': Expect variable name.",
                "[line 3] Error at '3': Expect variable name.",
            ]
        );
    }

    #[test]
    fn scoping_errors() {
        assert_eq!(
            errors("return 1;"),
            vec!["[line 1] Error at 'return': Can't return from top-level code."]
        );
        assert_eq!(
            errors("{ var a = a; }"),
            vec!["[line 1] Error at 'a': Can't read local variable in its own initializer."]
        );
        assert_eq!(
            errors("{ var a; var a; }"),
            vec!["[line 1] Error at 'a': Already a variable with this name in this scope."]
        );
        // Shadowing in an inner scope is fine.
        assert!(compile_source("{ var a; { var a; } }").1.is_ok());
    }

    #[test]
    fn too_many_constants() {
        let sum = (0..300)
            .map(|i| i.to_string())
            .collect::<Vec<_>>()
            .join(" + ");
        let errors = errors(&format!("print {};", sum));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].ends_with("Too many constants in one chunk."));
    }

    #[test]
    fn too_many_locals() {
        let decls: String = (0..256).map(|i| format!("var v{};", i)).collect();
        let errors = errors(&format!("{{ {} }}", decls));
        assert_eq!(
            errors,
            vec!["[line 1] Error at 'v255': Too many local variables in function."]
        );
    }

    #[test]
    fn too_many_arguments() {
        let args = vec!["nil"; 256].join(", ");
        let errors = errors(&format!("f({});", args));
        assert_eq!(
            errors,
            vec!["[line 1] Error at 'nil': Can't have more than 255 arguments."]
        );
    }

    #[test]
    fn upvalues_are_deduplicated() {
        let (heap, result) = compile_source(
            "fun outer() { var x = 1; var y = 2; fun inner() { x; y; x; } }",
        );
        let script = heap.function(result.unwrap()).unwrap();
        let outer = script
            .chunk
            .constants()
            .iter()
            .filter_map(Value::as_object)
            .find_map(|h| heap.function(h).ok())
            .unwrap();
        let inner = outer
            .chunk
            .constants()
            .iter()
            .filter_map(Value::as_object)
            .find_map(|h| heap.function(h).ok())
            .unwrap();
        assert_eq!(outer.upvalue_count, 0);
        assert_eq!(inner.upvalue_count, 2);
        assert_eq!(heap.function_name(inner).unwrap(), Some("inner"));
    }

    // The first function among a function's constants.
    fn nested<'h>(heap: &'h Heap, function: &Function) -> &'h Function {
        function
            .chunk
            .constants()
            .iter()
            .filter_map(Value::as_object)
            .find_map(|h| heap.function(h).ok())
            .unwrap()
    }

    #[test]
    fn closure_operands_disassemble() {
        let (heap, result) = compile_source(
            "fun outer() { var x = 1; var y = 2; fun mid() { fun inner() { return y + x; } return inner; } return mid; }",
        );
        let script = heap.function(result.unwrap()).unwrap();
        let outer = nested(&heap, script);
        let mid = nested(&heap, outer);
        let inner = nested(&heap, mid);

        assert_eq!(
            script.chunk.disassemble("<script>", &heap),
            "\
== <script> ==
0000    1 OP_CLOSURE          1 <fn outer>
0002    | OP_DEFINE_GLOBAL    0 'outer'
0004    | OP_NIL
0005    | OP_RETURN
"
        );
        // mid captures outer's locals directly.
        assert_eq!(
            outer.chunk.disassemble("outer", &heap),
            "\
== outer ==
0000    1 OP_CONSTANT         0 '1'
0002    | OP_CONSTANT         1 '2'
0004    | OP_CLOSURE          2 <fn mid>
0006    |                     local 2
0008    |                     local 1
0010    | OP_GET_LOCAL        3
0012    | OP_RETURN
0013    | OP_NIL
0014    | OP_RETURN
"
        );
        // inner reaches them through mid's upvalues.
        assert_eq!(
            mid.chunk.disassemble("mid", &heap),
            "\
== mid ==
0000    1 OP_CLOSURE          0 <fn inner>
0002    |                     upvalue 0
0004    |                     upvalue 1
0006    | OP_GET_LOCAL        1
0008    | OP_RETURN
0009    | OP_NIL
0010    | OP_RETURN
"
        );
        assert_eq!(
            inner.chunk.disassemble("inner", &heap),
            "\
== inner ==
0000    1 OP_GET_UPVALUE      0
0002    | OP_GET_UPVALUE      1
0004    | OP_ADD
0005    | OP_RETURN
0006    | OP_NIL
0007    | OP_RETURN
"
        );
        assert_eq!((mid.upvalue_count, inner.upvalue_count), (2, 2));
    }

    #[test]
    fn function_arity() {
        let (heap, result) = compile_source("fun add(a, b, c) { return a + b + c; }");
        let script = heap.function(result.unwrap()).unwrap();
        let add = script
            .chunk
            .constants()
            .iter()
            .filter_map(Value::as_object)
            .find_map(|h| heap.function(h).ok())
            .unwrap();
        assert_eq!(add.arity, 3);
        assert_eq!(add.upvalue_count, 0);
    }
}

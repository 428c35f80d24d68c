//! Contains the parser and single-pass bytecode compiler.
use std::rc::Rc;

use crate::chunk::{Label, WrittenOpcode};
use crate::gc::ActiveGC;
use crate::prelude::*;
use crate::value::Function;

/////////////////////////////////////////// Public API ////////////////////////////////////////////

/// Compiles the given source code and, if successful, returns the root [Function]. An [ActiveGC]
/// is required because string literals and identifiers are allocated and owned by the GC.
pub fn compile(source: &str, gc: &'_ ActiveGC) -> crate::Result<Function> {
    let parser = Parser::new(source, gc);
    let compiler = Compiler::new(parser);
    compiler.compile()
}

///////////////////////////////////// Implementation details //////////////////////////////////////

const U8_COUNT: usize = u8::MAX as usize + 1;

// `add_local`/`add_upvalue` below only push onto `locals`/`upvalues` while their length is strictly
// less than `U8_COUNT`, then hand back `(len - 1) as u8` as the slot index. That cast only stays
// lossless as long as `U8_COUNT` is exactly 256; pin it here so the bound can't silently drift.
static_assertions::const_assert_eq!(U8_COUNT, 256);

/// Whether a [Frame] is compiling the implicit top-level script, or a nested function body. Only
/// a [FunctionKind::Function] frame may contain a `return` with a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
}

/// A local variable known to a [Frame]. `depth == None` means the variable has been declared but
/// its initializer has not finished compiling yet — reading it in that state is an error.
#[derive(Clone)]
struct Local<'a> {
    name: &'a str,
    depth: Option<isize>,
    is_captured: bool,
}

/// One slot in a [Frame]'s upvalue table. `is_local` true means `index` is a local slot in the
/// immediately enclosing frame; false means `index` is itself an upvalue slot in that frame.
#[derive(Clone, Copy)]
struct UpvalueDescriptor {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. Frames live in [Compiler::frames], one pushed per nested
/// function body, addressed by index rather than by a raw `enclosing` pointer.
struct Frame<'a> {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local<'a>>,
    upvalues: Vec<UpvalueDescriptor>,
    scope_depth: isize,
}

impl<'a> Frame<'a> {
    /// Creates a new frame. Slot 0 of `locals` is reserved (the book's receiver placeholder; this
    /// language has no methods, so it is simply never referenced by name).
    fn new(kind: FunctionKind, name: Option<Rc<str>>) -> Frame<'a> {
        let mut function = Function::new();
        function.name = name;
        Frame {
            function,
            kind,
            locals: vec![Local {
                name: "",
                depth: Some(0),
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Parser state: a two-token lookahead window, plus error/recovery flags.
///
/// The reference to [ActiveGC] is required but never read directly — holding it guarantees that
/// the process-global string interner is installed for as long as this parser (and the string
/// constants it builds) exist.
#[derive(Debug)]
struct Parser<'a> {
    scanner: Scanner<'a>,
    current: Lexeme<'a>,
    previous: Lexeme<'a>,
    had_error: bool,
    panic_mode: bool,
    _active_gc: &'a ActiveGC,
}

/// Contains the compiler state: the [Parser] and the stack of in-progress [Frame]s.
struct Compiler<'a> {
    parser: Parser<'a>,
    frames: Vec<Frame<'a>>,
}

/// An action a Pratt-parser rule can take. An exhaustive tagged enum rather than a bare function
/// pointer, so adding a new expression form without wiring it into [ParseFn::dispatch] is a
/// compile error rather than a silently-missing rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ParseFn {
    Grouping,
    Unary,
    Binary,
    Number,
    StringLiteral,
    Literal,
    Variable,
    And,
    Or,
    Call,
}

impl ParseFn {
    fn dispatch(self, compiler: &mut Compiler, can_assign: bool) {
        match self {
            ParseFn::Grouping => grouping(compiler, can_assign),
            ParseFn::Unary => unary(compiler, can_assign),
            ParseFn::Binary => binary(compiler, can_assign),
            ParseFn::Number => number(compiler, can_assign),
            ParseFn::StringLiteral => string(compiler, can_assign),
            ParseFn::Literal => literal(compiler, can_assign),
            ParseFn::Variable => variable(compiler, can_assign),
            ParseFn::And => and_(compiler, can_assign),
            ParseFn::Or => or_(compiler, can_assign),
            ParseFn::Call => call(compiler, can_assign),
        }
    }
}

/// A rule in the Pratt parser table. See [Compiler::parse_precedence()] for usage.
#[derive(Copy, Clone)]
struct ParserRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

/// Precedence rules for [Token]s.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Eq)]
enum Precedence {
    None,
    /// `=`
    Assignment,
    /// `or`
    Or,
    /// `and`
    And,
    /// `==` `!=`
    Equality,
    /// `<` `>` `<=` `>=`
    Comparison,
    /// `+` `-`
    Term,
    /// `*` `/`
    Factor,
    /// `!` `-`
    Unary,
    /// `()`
    Call,
    /// Literals and groupings
    Primary,
}

impl Precedence {
    /// Returns the next higher level of precedence.
    ///
    /// # Panics
    ///
    /// Panics if called on [Precedence::Primary], the highest level.
    #[inline]
    fn higher_precedence(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => panic!("Tried to get higher precedence than primary"),
        }
    }
}

impl ParserRule {
    /// Returns one level of precedence higher than the rule's precedence.
    #[inline(always)]
    fn higher_precedence(&self) -> Precedence {
        self.precedence.higher_precedence()
    }
}

impl<'a> Parser<'a> {
    /// Creates a new parser for the given source code. Parsing string literals requires an active
    /// GC.
    fn new(source: &'a str, active_gc: &'a ActiveGC) -> Parser<'a> {
        let mut scanner = Scanner::new(source);
        let first_token = scanner.scan_token();
        let sentinel = scanner.make_sentinel("<before first token>");

        Parser {
            scanner,
            previous: sentinel,
            current: first_token,
            had_error: false,
            panic_mode: false,
            _active_gc: active_gc,
        }
    }

    /// Update `self.previous` and `self.current` such that they move one token further in the
    /// token stream, reporting (and skipping over) any ERROR tokens the scanner yields.
    fn advance(&mut self) {
        self.previous = self.current.clone();

        loop {
            self.current = self.scanner.scan_token();
            if self.current.token() != Token::Error {
                break;
            }

            self.error_at_current(self.current.text());
        }
    }

    /// Scan the next token. If the token is not of the desired type, emits `message` instead.
    fn consume(&mut self, desired_token: Token, message: &'static str) {
        if self.current.token() == desired_token {
            self.advance();
            return;
        }

        self.error_at_current(message);
    }

    /// Return true if the current token is equal to the given token.
    fn check(&self, token: Token) -> bool {
        self.current.token() == token
    }

    /// Advances if the current token matches `desired_token`. Returns whether it was matched.
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        if self.check(desired_token) {
            self.advance();
            return true;
        }
        false
    }

    /// Emit a compiler error, located at the previous [Lexeme]. In Pratt parsing, this is the
    /// handler you usually want, since the previous lexeme decided which [ParserRule] was taken.
    fn error(&mut self, message: &str) {
        self.error_at(self.previous.clone(), message)
    }

    /// Emit a compiler error, located at the current [Lexeme].
    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current.clone(), message)
    }

    /// Emit a compiler error, located at the given [Lexeme].
    fn error_at(&mut self, lexeme: Lexeme<'a>, message: &str) {
        // Suppress cascading errors until the next synchronization point.
        if self.panic_mode {
            return;
        }

        self.panic_mode = true;
        self.had_error = true;

        eprint!("[line {}] Error", lexeme.line());
        match lexeme.token() {
            Token::Eof => eprint!(" at end"),
            Token::Error => {}
            _ => eprint!(" at '{}'", lexeme.text()),
        }
        eprintln!(": {message}");
    }

    /// Discards tokens until we're likely at a statement boundary, so that one syntax error
    /// doesn't cascade into a flood of spurious ones.
    fn synchronize(&mut self) {
        self.panic_mode = false;

        while self.current.token() != Token::Eof {
            if self.previous.token() == Token::Semicolon {
                return;
            }

            match self.current.token() {
                Token::Class
                | Token::Fun
                | Token::Var
                | Token::For
                | Token::If
                | Token::While
                | Token::Print
                | Token::Return => return,
                _ => self.advance(),
            }
        }
    }
}

impl<'a> Compiler<'a> {
    /// Creates a new compiler with the given [Parser], with a single [FunctionKind::Script] frame.
    fn new(parser: Parser<'a>) -> Compiler<'a> {
        Compiler {
            parser,
            frames: vec![Frame::new(FunctionKind::Script, None)],
        }
    }

    /// Takes ownership of the compiler and compiles the whole source, returning the root
    /// [Function].
    fn compile(mut self) -> crate::Result<Function> {
        while !self.match_and_advance(Token::Eof) {
            self.declaration();
        }
        let (function, _upvalues) = self.end_compiler();

        if self.parser.had_error {
            return Err(InterpretationError::CompileError);
        }

        Ok(function)
    }

    /// Pops the current frame, appending the implicit trailing `NIL RETURN`. Returns the
    /// completed [Function] and the upvalue descriptors its closure (if any) needs inline.
    fn end_compiler(&mut self) -> (Function, Vec<UpvalueDescriptor>) {
        self.emit_return();
        let frame = self.frames.pop().expect("frame stack is never empty here");
        (frame.function, frame.upvalues)
    }

    ////////////////////////////////////////// Scoping ///////////////////////////////////////////

    fn begin_scope(&mut self) {
        self.frames.last_mut().unwrap().scope_depth += 1;
    }

    /// Pops one block scope, popping (or closing, if captured) each local that falls out of
    /// scope. The compile-time local list parallels the runtime stack, so this mirrors exactly
    /// what the runtime will do.
    fn end_scope(&mut self) {
        self.frames.last_mut().unwrap().scope_depth -= 1;

        loop {
            let falls_out_of_scope = {
                let frame = self.frames.last().unwrap();
                let scope_depth = frame.scope_depth;
                frame
                    .locals
                    .last()
                    .and_then(|local| local.depth)
                    .map_or(false, |depth| depth > scope_depth)
            };

            if !falls_out_of_scope {
                break;
            }

            let local = self.frames.last_mut().unwrap().locals.pop().unwrap();
            if local.is_captured {
                self.emit_instruction(OpCode::CloseUpvalue);
            } else {
                self.emit_instruction(OpCode::Pop);
            }
        }
    }

    //////////////////////////////////////// Pratt parsing ////////////////////////////////////////

    /// The core of the Pratt parsing algorithm.
    ///
    /// See: <https://en.wikipedia.org/wiki/Operator-precedence_parser#Pratt_parsing>
    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;

        match self.rule_from_previous().prefix {
            Some(prefix) => prefix.dispatch(self, can_assign),
            None => {
                self.parser.error("Expected expression.");
                return;
            }
        }

        while precedence <= self.rule_from_current().precedence {
            self.advance();
            let infix = self
                .rule_from_previous()
                .infix
                .expect("a rule with a defined precedence must always have an infix rule");
            infix.dispatch(self, can_assign);
        }

        if can_assign && self.match_and_advance(Token::Equal) {
            self.parser.error("Invalid assignment target.");
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /////////////////////////////////////// Name resolution ///////////////////////////////////////

    /// Adds `name`'s text to the current chunk's constant pool, for use as a global's name.
    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = ActiveGC::copy_string(name);
        self.make_constant(interned.into())
    }

    /// Looks for `name` among the locals of `frames[frame_index]`, scanning from the innermost
    /// declaration outward. Errors if the match is still mid-initialization.
    fn resolve_local(&mut self, frame_index: usize, name: &str) -> Option<u8> {
        let index = self.frames[frame_index]
            .locals
            .iter()
            .rposition(|local| local.name == name)?;

        if self.frames[frame_index].locals[index].depth.is_none() {
            self.parser
                .error("Cannot read a variable within its own initializer.");
        }

        u8::try_from(index).ok()
    }

    /// Resolves `name` as an upvalue of `frames[frame_index]`, walking the frame stack from
    /// innermost toward outermost by index (never by following a raw pointer). On a hit, installs
    /// an upvalue descriptor in every frame between `frame_index` and the capture site.
    fn resolve_upvalue(&mut self, frame_index: usize, name: &str) -> Option<u8> {
        if frame_index == 0 {
            return None;
        }
        let enclosing = frame_index - 1;

        if let Some(local_index) = self.resolve_local(enclosing, name) {
            self.frames[enclosing].locals[local_index as usize].is_captured = true;
            return Some(self.add_upvalue(frame_index, local_index, true));
        }

        if let Some(upvalue_index) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(frame_index, upvalue_index, false));
        }

        None
    }

    /// Adds an upvalue descriptor to `frames[frame_index]`, deduplicating against an existing
    /// matching entry.
    fn add_upvalue(&mut self, frame_index: usize, index: u8, is_local: bool) -> u8 {
        let frame = &mut self.frames[frame_index];

        if let Some(existing) = frame
            .upvalues
            .iter()
            .position(|up| up.index == index && up.is_local == is_local)
        {
            return existing as u8;
        }

        if frame.upvalues.len() >= U8_COUNT {
            self.parser
                .error("Too many closure variables within a function.");
            return 0;
        }

        frame.upvalues.push(UpvalueDescriptor { index, is_local });
        frame.function.upvalue_count = frame.upvalues.len() as u8;
        (frame.upvalues.len() - 1) as u8
    }

    /// Declares `self.parser.previous` as a local variable in the current scope. A no-op at global
    /// scope, since globals are resolved by name at runtime.
    fn declare_variable(&mut self) {
        let name = self.parser.previous.text();
        let scope_depth = self.frames.last().unwrap().scope_depth;
        if scope_depth == 0 {
            return;
        }

        let mut redeclared = false;
        for local in self.frames.last().unwrap().locals.iter().rev() {
            if let Some(depth) = local.depth {
                if depth < scope_depth {
                    break;
                }
            }
            if local.name == name {
                redeclared = true;
                break;
            }
        }

        if redeclared {
            self.parser
                .error("Already a variable with this name in this scope.");
        }

        self.add_local(name);
    }

    fn add_local(&mut self, name: &'a str) {
        if self.frames.last().unwrap().locals.len() >= U8_COUNT {
            self.parser.error("Too many local variables in function.");
            return;
        }

        self.frames.last_mut().unwrap().locals.push(Local {
            name,
            depth: None,
            is_captured: false,
        });
    }

    /// Consumes an identifier and declares it as a variable, returning a constant-pool index for
    /// its name (meaningful only at global scope; `0` is a safe placeholder at local scope).
    fn parse_variable(&mut self, error_message: &'static str) -> u8 {
        self.parser.consume(Token::Identifier, error_message);

        self.declare_variable();
        if self.frames.last().unwrap().scope_depth > 0 {
            return 0;
        }

        self.identifier_constant(self.parser.previous.text())
    }

    /// Marks the most recently declared local in the current frame as initialized. A no-op at
    /// global scope (there is no local to mark).
    fn mark_initialized(&mut self) {
        let frame = self.frames.last_mut().unwrap();
        if frame.scope_depth == 0 {
            return;
        }
        let depth = frame.scope_depth;
        frame.locals.last_mut().unwrap().depth = Some(depth);
    }

    fn define_variable(&mut self, global: u8) {
        if self.frames.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }

        self.emit_instruction(OpCode::DefineGlobal)
            .with_operand(global);
    }

    /// Parses a variable reference or assignment, depending on `can_assign` and whether `=`
    /// follows.
    fn named_variable(&mut self, name: &'a str, can_assign: bool) {
        let frame_index = self.frames.len() - 1;

        let (get_op, set_op, arg) = if let Some(arg) = self.resolve_local(frame_index, name) {
            (OpCode::GetLocal, OpCode::SetLocal, arg)
        } else if let Some(arg) = self.resolve_upvalue(frame_index, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, arg)
        } else {
            let arg = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, arg)
        };

        if can_assign && self.match_and_advance(Token::Equal) {
            self.expression();
            self.emit_instruction(set_op).with_operand(arg);
        } else {
            self.emit_instruction(get_op).with_operand(arg);
        }
    }

    //////////////////////////////////// Declarations & statements ////////////////////////////////

    fn declaration(&mut self) {
        if self.match_and_advance(Token::Fun) {
            self.fun_declaration();
        } else if self.match_and_advance(Token::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.parser.synchronize();
        }
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expected function name.");
        // Mark initialized immediately, so the function's own body can call it by name
        // (recursion) before compilation of the body has finished.
        self.mark_initialized();
        self.compile_function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expected variable name.");

        if self.match_and_advance(Token::Equal) {
            self.expression();
        } else {
            self.emit_instruction(OpCode::Nil);
        }

        self.parser
            .consume(Token::Semicolon, "Expected ';' after variable declaration.");

        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_and_advance(Token::Print) {
            self.print_statement();
        } else if self.match_and_advance(Token::For) {
            self.for_statement();
        } else if self.match_and_advance(Token::If) {
            self.if_statement();
        } else if self.match_and_advance(Token::Return) {
            self.return_statement();
        } else if self.match_and_advance(Token::While) {
            self.while_statement();
        } else if self.match_and_advance(Token::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.parser.check(Token::RightBrace) && !self.parser.check(Token::Eof) {
            self.declaration();
        }

        self.parser.consume(Token::RightBrace, "Expected '}' after block.");
    }

    /// Compiles a nested function's parameter list and body, pushing a fresh frame for its
    /// duration. Leaves a `CLOSURE` instruction (plus upvalue descriptor bytes) in the enclosing
    /// frame's chunk.
    fn compile_function(&mut self, kind: FunctionKind) {
        let name = ActiveGC::copy_string(self.parser.previous.text());
        self.frames.push(Frame::new(kind, Some(name)));
        self.begin_scope();

        self.parser
            .consume(Token::LeftParen, "Expected '(' after function name.");
        if !self.parser.check(Token::RightParen) {
            loop {
                if self.frames.last().unwrap().function.arity == u8::MAX {
                    self.parser.error("Cannot have more than 255 parameters.");
                } else {
                    self.frames.last_mut().unwrap().function.arity += 1;
                }
                let constant = self.parse_variable("Expected parameter name.");
                self.define_variable(constant);

                if !self.match_and_advance(Token::Comma) {
                    break;
                }
            }
        }
        self.parser
            .consume(Token::RightParen, "Expected ')' after parameters.");
        self.parser
            .consume(Token::LeftBrace, "Expected '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Rc::new(function).into());
        self.emit_instruction(OpCode::Closure).with_operand(constant);

        let line = self.line_number_of_prefix();
        for upvalue in upvalues {
            self.current_chunk().write_byte(upvalue.is_local as u8, line);
            self.current_chunk().write_byte(upvalue.index, line);
        }
    }

    fn if_statement(&mut self) {
        self.parser.consume(Token::LeftParen, "Expected '(' after 'if'.");
        self.expression();
        self.parser
            .consume(Token::RightParen, "Expected ')' after condition.");

        let then_jump = self
            .emit_instruction(OpCode::JumpIfFalse)
            .with_jump_placeholder();
        self.emit_instruction(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_instruction(OpCode::Jump).with_jump_placeholder();

        self.patch_jump(then_jump);
        self.emit_instruction(OpCode::Pop);

        if self.match_and_advance(Token::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();

        self.parser.consume(Token::LeftParen, "Expected '(' after 'while'.");
        self.expression();
        self.parser
            .consume(Token::RightParen, "Expected ')' after condition.");

        let exit_jump = self
            .emit_instruction(OpCode::JumpIfFalse)
            .with_jump_placeholder();
        self.emit_instruction(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_instruction(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.parser.consume(Token::LeftParen, "Expected '(' after 'for'.");

        if self.match_and_advance(Token::Semicolon) {
            // No initializer clause.
        } else if self.match_and_advance(Token::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;
        if !self.match_and_advance(Token::Semicolon) {
            self.expression();
            self.parser
                .consume(Token::Semicolon, "Expected ';' after loop condition.");

            exit_jump = Some(
                self.emit_instruction(OpCode::JumpIfFalse)
                    .with_jump_placeholder(),
            );
            self.emit_instruction(OpCode::Pop);
        }

        if !self.match_and_advance(Token::RightParen) {
            let body_jump = self.emit_instruction(OpCode::Jump).with_jump_placeholder();
            let increment_start = self.current_chunk().len();

            self.expression();
            self.emit_instruction(OpCode::Pop);
            self.parser
                .consume(Token::RightParen, "Expected ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_instruction(OpCode::Pop);
        }

        self.end_scope();
    }

    fn return_statement(&mut self) {
        if self.frames.last().unwrap().kind == FunctionKind::Script {
            self.parser.error("Cannot return from top-level code.");
        }

        if self.match_and_advance(Token::Semicolon) {
            self.emit_return();
        } else {
            self.expression();
            self.parser
                .consume(Token::Semicolon, "Expected ';' after return value.");
            self.emit_instruction(OpCode::Return);
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.parser
            .consume(Token::Semicolon, "Expected ';' after print value.");
        self.emit_instruction(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.parser.consume(Token::Semicolon, "Expected ';' after expression.");
        self.emit_instruction(OpCode::Pop);
    }

    fn argument_list(&mut self) -> u8 {
        let mut count: u8 = 0;

        if !self.parser.check(Token::RightParen) {
            loop {
                self.expression();
                if count == u8::MAX {
                    self.parser.error("Cannot have more than 255 arguments.");
                } else {
                    count += 1;
                }

                if !self.match_and_advance(Token::Comma) {
                    break;
                }
            }
        }

        self.parser
            .consume(Token::RightParen, "Expected ')' after arguments.");
        count
    }

    ////////////////////////////////////////// Emission ///////////////////////////////////////////

    /// Appends `NIL RETURN`: the implicit return value every function body falls through to, and
    /// what a bare `return;` also emits.
    fn emit_return(&mut self) {
        self.emit_instruction(OpCode::Nil);
        self.emit_instruction(OpCode::Return);
    }

    fn emit_constant(&mut self, value: Value) {
        let index = self.make_constant(value);
        self.emit_instruction(OpCode::Constant).with_operand(index);
    }

    /// Appends a new constant to the current chunk, substituting index `0` and reporting
    /// `"Too many constants in one chunk."` past the 256-constant limit.
    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_chunk().add_constant(value) {
            index
        } else {
            self.parser.error("Too many constants in one chunk.");
            0
        }
    }

    fn emit_instruction(&mut self, opcode: OpCode) -> WrittenOpcode<'_> {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(opcode, line)
    }

    fn emit_instructions(&mut self, op1: OpCode, op2: OpCode) -> WrittenOpcode<'_> {
        let line = self.line_number_of_prefix();
        self.current_chunk().write_opcode(op1, line);
        self.current_chunk().write_opcode(op2, line)
    }

    fn emit_loop(&mut self, loop_start: usize) {
        let line = self.line_number_of_prefix();
        let result = self
            .current_chunk()
            .write_opcode(OpCode::Loop, line)
            .with_loop_distance(loop_start);
        if let Err(message) = result {
            self.parser.error(message);
        }
    }

    fn patch_jump(&mut self, label: Label) {
        if let Err(message) = label.patch(self.current_chunk()) {
            self.parser.error(message);
        }
    }

    ///////////////////////////////////////// Aliases /////////////////////////////////////////////

    #[inline(always)]
    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.frames.last_mut().unwrap().function.chunk
    }

    #[inline(always)]
    fn advance(&mut self) {
        self.parser.advance()
    }

    #[inline(always)]
    fn line_number_of_prefix(&self) -> usize {
        self.parser.previous.line()
    }

    #[inline(always)]
    fn match_and_advance(&mut self, desired_token: Token) -> bool {
        self.parser.match_and_advance(desired_token)
    }

    #[inline(always)]
    fn rule_from_previous(&self) -> ParserRule {
        get_rule(self.previous_token())
    }

    #[inline(always)]
    fn rule_from_current(&self) -> ParserRule {
        get_rule(self.parser.current.token())
    }

    #[inline(always)]
    fn previous_token(&self) -> Token {
        self.parser.previous.token()
    }
}

////////////////////////////////////////// Parser rules ///////////////////////////////////////////

/// Makes defining [ParserRule]s a bit cleaner looking.
macro_rules! rule {
    ($prefix:expr, $infix:expr, $precedence:expr) => {
        ParserRule {
            prefix: $prefix,
            infix: $infix,
            precedence: $precedence,
        }
    };
}

#[rustfmt::skip]
fn get_rule(token: Token) -> ParserRule {
    use Token::*;
    match token {
        //                     Prefix                          Infix                   Precedence
        LeftParen    => rule!{ Some(ParseFn::Grouping),        Some(ParseFn::Call),    Precedence::Call },
        RightParen   => rule!{ None,                           None,                   Precedence::None },
        LeftBrace    => rule!{ None,                           None,                   Precedence::None },
        RightBrace   => rule!{ None,                           None,                   Precedence::None },
        Comma        => rule!{ None,                           None,                   Precedence::None },
        Dot          => rule!{ None,                           None,                   Precedence::None },
        Minus        => rule!{ Some(ParseFn::Unary),           Some(ParseFn::Binary),  Precedence::Term },
        Plus         => rule!{ None,                           Some(ParseFn::Binary),  Precedence::Term },
        Semicolon    => rule!{ None,                           None,                   Precedence::None },
        Slash        => rule!{ None,                           Some(ParseFn::Binary),  Precedence::Factor },
        Star         => rule!{ None,                           Some(ParseFn::Binary),  Precedence::Factor },
        Bang         => rule!{ Some(ParseFn::Unary),           None,                   Precedence::None },
        BangEqual    => rule!{ None,                           Some(ParseFn::Binary),  Precedence::Equality },
        Equal        => rule!{ None,                           None,                   Precedence::None },
        EqualEqual   => rule!{ None,                           Some(ParseFn::Binary),  Precedence::Equality },
        Greater      => rule!{ None,                           Some(ParseFn::Binary),  Precedence::Comparison },
        GreaterEqual => rule!{ None,                           Some(ParseFn::Binary),  Precedence::Comparison },
        Less         => rule!{ None,                           Some(ParseFn::Binary),  Precedence::Comparison },
        LessEqual    => rule!{ None,                           Some(ParseFn::Binary),  Precedence::Comparison },
        Identifier   => rule!{ Some(ParseFn::Variable),        None,                   Precedence::None },
        StrLiteral   => rule!{ Some(ParseFn::StringLiteral),   None,                   Precedence::None },
        Number       => rule!{ Some(ParseFn::Number),          None,                   Precedence::None },
        And          => rule!{ None,                           Some(ParseFn::And),     Precedence::And },
        Class        => rule!{ None,                           None,                   Precedence::None },
        Else         => rule!{ None,                           None,                   Precedence::None },
        False        => rule!{ Some(ParseFn::Literal),         None,                   Precedence::None },
        For          => rule!{ None,                           None,                   Precedence::None },
        Fun          => rule!{ None,                           None,                   Precedence::None },
        If           => rule!{ None,                           None,                   Precedence::None },
        Nil          => rule!{ Some(ParseFn::Literal),         None,                   Precedence::None },
        Or           => rule!{ None,                           Some(ParseFn::Or),      Precedence::Or },
        Print        => rule!{ None,                           None,                   Precedence::None },
        Return       => rule!{ None,                           None,                   Precedence::None },
        Super        => rule!{ None,                           None,                   Precedence::None },
        This         => rule!{ None,                           None,                   Precedence::None },
        True         => rule!{ Some(ParseFn::Literal),         None,                   Precedence::None },
        Var          => rule!{ None,                           None,                   Precedence::None },
        While        => rule!{ None,                           None,                   Precedence::None },
        Error        => rule!{ None,                           None,                   Precedence::None },
        Eof          => rule!{ None,                           None,                   Precedence::None },
    }
}

/// Parses `(expr)` as a prefix. Assumes `(` has been consumed.
fn grouping(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::LeftParen, compiler.previous_token());
    compiler.expression();
    compiler
        .parser
        .consume(Token::RightParen, "Expected ')' after expression.");
}

/// Parses a number literal as a prefix. Assumes the number has been consumed.
fn number(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::Number, compiler.previous_token());
    let value = compiler
        .parser
        .previous
        .text()
        .parse::<f64>()
        .expect("a Token::Number lexeme must always parse as a float");
    compiler.emit_constant(value.into());
}

/// Parses a unary operator as a prefix. Assumes the operator has been consumed.
fn unary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();

    compiler.parse_precedence(Precedence::Unary);

    match operator {
        Token::Bang => compiler.emit_instruction(OpCode::Not),
        Token::Minus => compiler.emit_instruction(OpCode::Negate),
        _ => unreachable!("get_rule only wires Unary to ! and -"),
    };
}

/// Parses a binary operator as an infix. Assumes the operator has been consumed.
fn binary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous_token();
    let rule = get_rule(operator);

    compiler.parse_precedence(rule.higher_precedence());
    match operator {
        Token::BangEqual => compiler.emit_instructions(OpCode::Equal, OpCode::Not),
        Token::EqualEqual => compiler.emit_instruction(OpCode::Equal),
        Token::Greater => compiler.emit_instruction(OpCode::Greater),
        Token::GreaterEqual => compiler.emit_instructions(OpCode::Less, OpCode::Not),
        Token::Less => compiler.emit_instruction(OpCode::Less),
        Token::LessEqual => compiler.emit_instructions(OpCode::Greater, OpCode::Not),
        Token::Plus => compiler.emit_instruction(OpCode::Add),
        Token::Minus => compiler.emit_instruction(OpCode::Subtract),
        Token::Star => compiler.emit_instruction(OpCode::Multiply),
        Token::Slash => compiler.emit_instruction(OpCode::Divide),
        _ => unreachable!("get_rule only wires Binary to these operators"),
    };
}

/// Parses a keyword literal as a prefix. Assumes the keyword has been consumed.
fn literal(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.previous_token() {
        Token::False => compiler.emit_instruction(OpCode::False),
        Token::Nil => compiler.emit_instruction(OpCode::Nil),
        Token::True => compiler.emit_instruction(OpCode::True),
        _ => unreachable!("get_rule only wires Literal to false/nil/true"),
    };
}

/// Parses a string literal, stripping its surrounding quotes and interning it.
fn string(compiler: &mut Compiler, _can_assign: bool) {
    debug_assert_eq!(Token::StrLiteral, compiler.previous_token());

    let literal = compiler.parser.previous.text();
    let last_index = literal.len() - 1;
    let contents = &literal[1..last_index];

    let interned = ActiveGC::copy_string(contents);
    compiler.emit_constant(interned.into());
}

/// Parses a bare identifier: either a variable reference or an assignment.
fn variable(compiler: &mut Compiler, can_assign: bool) {
    let name = compiler.parser.previous.text();
    compiler.named_variable(name, can_assign);
}

/// Short-circuiting `and`. Assumes the left operand has already been parsed and its value is on
/// the stack.
fn and_(compiler: &mut Compiler, _can_assign: bool) {
    let end_jump = compiler
        .emit_instruction(OpCode::JumpIfFalse)
        .with_jump_placeholder();

    compiler.emit_instruction(OpCode::Pop);
    compiler.parse_precedence(Precedence::And);

    compiler.patch_jump(end_jump);
}

/// Short-circuiting `or`. Assumes the left operand has already been parsed and its value is on
/// the stack.
fn or_(compiler: &mut Compiler, _can_assign: bool) {
    let else_jump = compiler
        .emit_instruction(OpCode::JumpIfFalse)
        .with_jump_placeholder();
    let end_jump = compiler.emit_instruction(OpCode::Jump).with_jump_placeholder();

    compiler.patch_jump(else_jump);
    compiler.emit_instruction(OpCode::Pop);

    compiler.parse_precedence(Precedence::Or);
    compiler.patch_jump(end_jump);
}

/// Parses a call's argument list as an infix. Assumes `(` has been consumed.
fn call(compiler: &mut Compiler, _can_assign: bool) {
    let arg_count = compiler.argument_list();
    compiler.emit_instruction(OpCode::Call).with_operand(arg_count);
}

////////////////////////////////////////////// Tests //////////////////////////////////////////////

#[cfg(test)]
mod test {
    use serial_test::serial;

    use super::*;

    /// Compiles `source` with a freshly-installed GC, asserting the compile succeeds.
    fn compile_ok(source: &str) -> Function {
        let gc = ActiveGC::install();
        compile(source, &gc).expect("expected this source to compile successfully")
    }

    /// Compiles `source`, asserting the compile fails.
    fn compile_err(source: &str) {
        let gc = ActiveGC::install();
        assert!(
            compile(source, &gc).is_err(),
            "expected this source to fail to compile: {source}"
        );
    }

    /// Walks every instruction in `function`'s chunk, returning `(offset, opcode)` pairs and
    /// skipping each instruction's operand bytes (including, for `CLOSURE`, its trailing upvalue
    /// descriptor pairs).
    fn decode_instructions(function: &Function) -> Vec<(usize, OpCode)> {
        use OpCode::*;

        let mut ops = Vec::new();
        let mut offset = 0;
        while let Some(entry) = function.chunk.get(offset) {
            let opcode = entry.as_opcode().expect("every byte at an instruction boundary decodes");
            ops.push((offset, opcode));
            offset += 1;

            match opcode {
                Nil | True | False | Pop | Equal | Greater | Less | Add | Subtract | Multiply
                | Divide | Not | Negate | Print | CloseUpvalue | Return => {}
                Constant | GetLocal | SetLocal | GetGlobal | DefineGlobal | SetGlobal
                | GetUpvalue | SetUpvalue | Call => offset += 1,
                Jump | JumpIfFalse | Loop => offset += 2,
                Closure => {
                    let constant_index = function.chunk.get(offset).unwrap().as_constant_index();
                    offset += 1;
                    let nested = function.chunk.constants[constant_index]
                        .as_function()
                        .expect("CLOSURE's operand always indexes a Function constant");
                    offset += 2 * nested.upvalue_count as usize;
                }
            }
        }
        ops
    }

    /// Decodes just the opcodes, in order, discarding their offsets.
    fn opcodes(function: &Function) -> Vec<OpCode> {
        decode_instructions(function).into_iter().map(|(_, op)| op).collect()
    }

    /// The set of byte offsets at which a decoded instruction begins.
    fn instruction_boundaries(function: &Function) -> std::collections::HashSet<usize> {
        decode_instructions(function).into_iter().map(|(offset, _)| offset).collect()
    }

    /// Reads the big-endian `u16` jump/loop operand written immediately after the instruction at
    /// `opcode_offset`.
    fn jump_operand(function: &Function, opcode_offset: usize) -> u16 {
        let hi = function.chunk.get(opcode_offset + 1).unwrap().as_byte();
        let lo = function.chunk.get(opcode_offset + 2).unwrap().as_byte();
        u16::from_be_bytes([hi, lo])
    }

    #[test]
    #[serial]
    fn precedence_confidence_check() {
        assert!(Precedence::Assignment < Precedence::Or);
        assert!(Precedence::Or < Precedence::And);
        assert!(Precedence::And < Precedence::Equality);
        assert!(Precedence::Equality < Precedence::Comparison);
        assert!(Precedence::Call > Precedence::Factor);
        assert!(Precedence::Factor > Precedence::Term);
        assert_eq!(Precedence::And, Precedence::Or.higher_precedence());
        assert_eq!(Precedence::Factor, Precedence::Term.higher_precedence());
    }

    #[test]
    #[serial]
    fn print_arithmetic() {
        let function = compile_ok("print 1 + 2;");
        assert_eq!(
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::Add,
                OpCode::Print,
                OpCode::Nil,
                OpCode::Return,
            ],
            opcodes(&function)
        );
    }

    #[test]
    #[serial]
    fn global_variable_roundtrip() {
        let function = compile_ok("var x = 10; print x;");
        assert_eq!(
            vec![
                OpCode::Constant,
                OpCode::DefineGlobal,
                OpCode::GetGlobal,
                OpCode::Print,
                OpCode::Nil,
                OpCode::Return,
            ],
            opcodes(&function)
        );
    }

    #[test]
    #[serial]
    fn nested_blocks_use_local_slots() {
        let function = compile_ok("{ var a = 1; { var b = 2; print a + b; } }");
        assert_eq!(
            vec![
                OpCode::Constant,
                OpCode::Constant,
                OpCode::GetLocal,
                OpCode::GetLocal,
                OpCode::Add,
                OpCode::Print,
                OpCode::Pop,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ],
            opcodes(&function)
        );
    }

    #[test]
    #[serial]
    fn if_else_emits_two_jumps() {
        let function = compile_ok("if (true) print 1; else print 2;");
        assert_eq!(
            vec![
                OpCode::True,
                OpCode::JumpIfFalse,
                OpCode::Pop,
                OpCode::Constant,
                OpCode::Print,
                OpCode::Jump,
                OpCode::Pop,
                OpCode::Constant,
                OpCode::Print,
                OpCode::Nil,
                OpCode::Return,
            ],
            opcodes(&function)
        );
    }

    #[test]
    #[serial]
    fn while_loop_jumps_backward() {
        let function = compile_ok("while (true) print 1;");
        assert_eq!(
            vec![
                OpCode::True,
                OpCode::JumpIfFalse,
                OpCode::Pop,
                OpCode::Constant,
                OpCode::Print,
                OpCode::Loop,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ],
            opcodes(&function)
        );
    }

    #[test]
    #[serial]
    fn closure_captures_enclosing_local() {
        let function =
            compile_ok("fun outer() { var x = 1; fun inner() { print x; } inner(); } outer();");

        assert_eq!(
            vec![OpCode::Closure, OpCode::DefineGlobal, OpCode::GetGlobal, OpCode::Call, OpCode::Pop, OpCode::Nil, OpCode::Return],
            opcodes(&function)
        );

        // No `CLOSE_UPVALUE` is emitted here: falling off the end of a function body discards its
        // whole local-variable window at once (via `RETURN`), so there's nothing to close
        // explicitly — unlike a block ending mid-function, which pops/closes one slot at a time.
        let outer = function.chunk.get(1).unwrap().resolve_constant().unwrap();
        let outer = outer.as_function().unwrap();
        assert_eq!(
            vec![
                OpCode::Constant,
                OpCode::Closure,
                OpCode::GetLocal,
                OpCode::Call,
                OpCode::Pop,
                OpCode::Nil,
                OpCode::Return,
            ],
            opcodes(outer)
        );

        let inner = outer.chunk.get(3).unwrap().resolve_constant().unwrap();
        let inner = inner.as_function().unwrap();
        assert_eq!(1, inner.upvalue_count);
        assert_eq!(
            vec![OpCode::GetUpvalue, OpCode::Print, OpCode::Nil, OpCode::Return],
            opcodes(inner)
        );
    }

    #[test]
    #[serial]
    fn self_reference_in_initializer_only_errors_inside_a_block() {
        compile_ok("var a = a;");
        compile_err("{ var a = a; }");
    }

    #[test]
    #[serial]
    fn too_many_locals_reports_and_recovers() {
        let mut source = String::from("{\n");
        for i in 0..257 {
            source.push_str(&format!("var v{i} = {i};\n"));
        }
        source.push('}');
        compile_err(&source);
    }

    #[test]
    #[serial]
    fn too_many_constants_reports_and_recovers() {
        let mut source = String::new();
        for i in 0..257 {
            source.push_str(&format!("print {i}.5;\n"));
        }
        compile_err(&source);
    }

    #[test]
    #[serial]
    fn top_level_return_is_an_error() {
        compile_err("return 1;");
    }

    #[test]
    #[serial]
    fn invalid_assignment_target_is_an_error() {
        compile_err("1 + 2 = 3;");
    }

    #[test]
    #[serial]
    fn too_many_upvalues_reports_and_recovers() {
        // No single enclosing frame holds more than 256 locals (each frame's own local cap is
        // never hit), but `inner` captures a name from each of them: 150 from the top-level block
        // (captured transitively, as upvalues-of-upvalues) plus 150 from `outer`'s own block
        // (captured directly), for 300 distinct upvalue slots in `inner` alone.
        let mut source = String::from("{\n");
        for i in 0..150 {
            source.push_str(&format!("var s{i} = {i};\n"));
        }
        source.push_str("fun outer() {\n");
        for i in 0..150 {
            source.push_str(&format!("var o{i} = {i};\n"));
        }
        source.push_str("fun inner() {\n");
        for i in 0..150 {
            source.push_str(&format!("s{i};\n"));
        }
        for i in 0..150 {
            source.push_str(&format!("o{i};\n"));
        }
        source.push_str("}\ninner();\n}\nouter();\n");
        compile_err(&source);
    }

    #[test]
    #[serial]
    fn too_many_parameters_reports_and_recovers() {
        let params: Vec<String> = (0..256).map(|i| format!("p{i}")).collect();
        let source = format!("fun f({}) {{}}", params.join(", "));
        compile_err(&source);
    }

    #[test]
    #[serial]
    fn two_hundred_fifty_five_parameters_is_the_boundary() {
        let params: Vec<String> = (0..255).map(|i| format!("p{i}")).collect();
        let source = format!("fun f({}) {{}}", params.join(", "));
        compile_ok(&source);
    }

    #[test]
    #[serial]
    fn too_many_arguments_reports_and_recovers() {
        let args: Vec<String> = (0..256).map(|i| i.to_string()).collect();
        let source = format!("fun f() {{}}\nf({});", args.join(", "));
        compile_err(&source);
    }

    #[test]
    #[serial]
    fn jump_spanning_over_65535_bytes_is_an_error() {
        // `true; ` compiles to `TRUE, POP` (2 bytes, no constant), so 35,000 repetitions comfortably
        // clears the 65535-byte span the `then` branch's forward jump would have to patch over.
        let mut source = String::from("if (true) {\n");
        for _ in 0..35_000 {
            source.push_str("true;\n");
        }
        source.push('}');
        compile_err(&source);
    }

    #[test]
    #[serial]
    fn loop_body_over_65535_bytes_is_an_error() {
        let mut source = String::from("while (true) {\n");
        for _ in 0..35_000 {
            source.push_str("true;\n");
        }
        source.push('}');
        compile_err(&source);
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        /// Builds `{ var v0 = 0; var v1 = 1; ...; }` with `n` locals declared in one block.
        fn block_with_locals(n: usize) -> String {
            let mut source = String::from("{\n");
            for i in 0..n {
                source.push_str(&format!("var v{i} = {i};\n"));
            }
            source.push('}');
            source
        }

        /// A small recursive grammar of constant-foldable-looking expressions, for exercising the
        /// compiler's expression parsing at varying nesting depth.
        fn arb_expr() -> impl Strategy<Value = String> {
            let leaf = prop_oneof![
                (0u32..1000).prop_map(|n| n.to_string()),
                Just("true".to_string()),
                Just("false".to_string()),
                Just("nil".to_string()),
            ];
            leaf.prop_recursive(4, 64, 4, |inner| {
                prop_oneof![
                    (inner.clone(), inner.clone()).prop_map(|(a, b)| format!("({a} + {b})")),
                    (inner.clone(), inner).prop_map(|(a, b)| format!("({a} == {b})")),
                ]
            })
        }

        proptest! {
            /// For all programs declaring N locals in one scope, exactly N `POP`s are emitted in
            /// reverse declaration order when the scope ends, and the chunk still ends in
            /// `NIL, RETURN` with one line entry per byte.
            #[test]
            #[serial]
            fn n_locals_in_a_scope_emit_n_pops(n in 0usize..200) {
                let function = compile_ok(&block_with_locals(n));
                let ops = opcodes(&function);

                prop_assert_eq!(function.chunk.len(), function.chunk.code().len());
                prop_assert_eq!(ops[ops.len() - 2], OpCode::Nil);
                prop_assert_eq!(ops[ops.len() - 1], OpCode::Return);

                let pops = ops[..ops.len() - 2]
                    .iter()
                    .rev()
                    .take_while(|op| **op == OpCode::Pop)
                    .count();
                prop_assert_eq!(pops, n);
            }

            /// Compiling the same source twice yields byte-identical opcode streams and
            /// value-equal constant pools (identity of interned strings may differ, but `Rc<str>`
            /// value equality does not).
            #[test]
            #[serial]
            fn compiling_the_same_source_twice_is_idempotent(expr in arb_expr()) {
                let source = format!("print {expr};");
                let a = compile_ok(&source);
                let b = compile_ok(&source);

                prop_assert_eq!(opcodes(&a), opcodes(&b));
                prop_assert_eq!(a.chunk.constants.len(), b.chunk.constants.len());
                for (x, y) in a.chunk.constants.iter().zip(b.chunk.constants.iter()) {
                    prop_assert_eq!(x, y);
                }
            }

            /// Every `JUMP`/`JUMP_IF_FALSE` target, computed from its recorded offset and operand,
            /// lies within the chunk and lands exactly on an instruction boundary.
            #[test]
            #[serial]
            fn forward_jumps_land_on_instruction_boundaries(
                depth in 0usize..4,
                branches in prop::collection::vec(any::<bool>(), 1..6),
            ) {
                let mut source = String::new();
                for (i, taken) in branches.iter().enumerate() {
                    for _ in 0..depth {
                        source.push_str("if (true) {\n");
                    }
                    source.push_str(&format!("if ({taken}) {{ print {i}; }} else {{ print -{i}; }}\n"));
                    for _ in 0..depth {
                        source.push_str("}\n");
                    }
                }

                let function = compile_ok(&source);
                let boundaries = instruction_boundaries(&function);

                for (offset, opcode) in decode_instructions(&function) {
                    if matches!(opcode, OpCode::Jump | OpCode::JumpIfFalse) {
                        let distance = jump_operand(&function, offset) as usize;
                        let target = offset + 3 + distance;
                        prop_assert!(target <= function.chunk.len());
                        if target < function.chunk.len() {
                            prop_assert!(boundaries.contains(&target));
                        }
                    }
                }
            }

            /// A `257`th constant always reports the documented overflow message, regardless of
            /// what the first 256 constants are; fewer than 257 never does.
            #[test]
            #[serial]
            fn constant_pool_overflow_boundary(extra in 0usize..5) {
                let count = 256 + extra;
                let mut source = String::new();
                for i in 0..count {
                    source.push_str(&format!("print {i}.5;\n"));
                }
                if count > 256 {
                    compile_err(&source);
                } else {
                    compile_ok(&source);
                }
            }
        }
    }
}

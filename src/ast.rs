//! Grammar model: the instruction tree the scheduler interprets.

use crate::expr::Expression;

/// Stable identifier of an instruction, assigned in pre-order by [`Grammar::new`].
pub type NodeId = usize;

/// Root grammar: top-level instructions plus grammar-defined codecs.
#[derive(Debug, Clone)]
pub struct Grammar {
    instructions: Vec<Instruction>,
    codecs: Vec<CodecDef>,
    node_count: usize,
}

/// A custom codec declared by the grammar (`codec name = expression;`).
#[derive(Debug, Clone, PartialEq)]
pub struct CodecDef {
    pub name: String,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct Instruction {
    pub id: NodeId,
    /// Variable name this node exports into its scope.
    pub reference: Option<String>,
    pub kind: InstructionKind,
}

#[derive(Debug, Clone)]
pub enum InstructionKind {
    Fixed {
        size: Size,
        codec: Option<String>,
        constraints: Vec<Constraint>,
    },
    Container {
        size: Option<Size>,
        content: Vec<Instruction>,
    },
    Repeat {
        until: Vec<Instruction>,
        body: Vec<Instruction>,
    },
    If {
        condition: Expression,
        then: Vec<Instruction>,
    },
    /// Terminates synthetic children lists in derived trees; never executed.
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Bit,
    Byte,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SizeValue {
    Literal(i64),
    Expr(Expression),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Size {
    pub value: SizeValue,
    pub unit: Unit,
}

impl Size {
    pub fn bytes(n: i64) -> Self {
        Size {
            value: SizeValue::Literal(n),
            unit: Unit::Byte,
        }
    }

    pub fn bits(n: i64) -> Self {
        Size {
            value: SizeValue::Literal(n),
            unit: Unit::Bit,
        }
    }

    pub fn expr(expression: Expression, unit: Unit) -> Self {
        let value = match expression.constant() {
            Some(n) => SizeValue::Literal(n),
            None => SizeValue::Expr(expression),
        };
        Size { value, unit }
    }

    /// Splits a resolved amount into `(bytes, bits)` for [`Offset::add`](crate::offset::Offset::add).
    pub fn delta(&self, amount: i64) -> (i64, i64) {
        match self.unit {
            Unit::Byte => (amount, 0),
            Unit::Bit => (0, amount),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// Every byte of the field must be zero.
    IsNull,
    /// The field must hold exactly these bytes.
    Equals(Vec<u8>),
}

impl Constraint {
    pub fn check(&self, bytes: &[u8]) -> Result<(), String> {
        match self {
            Constraint::IsNull => match bytes.iter().position(|b| *b != 0) {
                Some(i) => Err(format!("non-zero byte 0x{:02X} at +{}", bytes[i], i)),
                None => Ok(()),
            },
            Constraint::Equals(expected) => {
                if bytes == expected.as_slice() {
                    Ok(())
                } else {
                    Err(format!("expected {:02X?}, found {:02X?}", expected, bytes))
                }
            }
        }
    }
}

impl Instruction {
    fn new(kind: InstructionKind) -> Self {
        Instruction {
            id: 0,
            reference: None,
            kind,
        }
    }

    pub fn fixed(size: Size) -> Self {
        Instruction::new(InstructionKind::Fixed {
            size,
            codec: None,
            constraints: Vec::new(),
        })
    }

    pub fn container(size: Option<Size>, content: Vec<Instruction>) -> Self {
        Instruction::new(InstructionKind::Container { size, content })
    }

    pub fn repeat(until: Vec<Instruction>, body: Vec<Instruction>) -> Self {
        Instruction::new(InstructionKind::Repeat { until, body })
    }

    pub fn when(condition: Expression, then: Vec<Instruction>) -> Self {
        Instruction::new(InstructionKind::If { condition, then })
    }

    pub fn trailer() -> Self {
        Instruction::new(InstructionKind::Trailer)
    }

    pub fn with_ref(mut self, name: &str) -> Self {
        self.reference = Some(name.to_string());
        self
    }

    /// Sets the codec of a fixed field; ignored for other kinds.
    pub fn with_codec(mut self, name: &str) -> Self {
        if let InstructionKind::Fixed { codec, .. } = &mut self.kind {
            *codec = Some(name.to_string());
        }
        self
    }

    /// Adds a constraint to a fixed field; ignored for other kinds.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        if let InstructionKind::Fixed { constraints, .. } = &mut self.kind {
            constraints.push(constraint);
        }
        self
    }

    /// Label used for output nodes and anonymous scopes.
    pub fn label(&self) -> String {
        match &self.reference {
            Some(r) => r.clone(),
            None => format!("{}@{}", self.kind_name(), self.id),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            InstructionKind::Fixed { .. } => "fixed",
            InstructionKind::Container { .. } => "container",
            InstructionKind::Repeat { .. } => "repeat",
            InstructionKind::If { .. } => "if",
            InstructionKind::Trailer => "trailer",
        }
    }

    /// Nested instruction lists, in declaration order.
    pub fn children(&self) -> Vec<&[Instruction]> {
        match &self.kind {
            InstructionKind::Container { content, .. } => vec![content.as_slice()],
            InstructionKind::Repeat { until, body } => vec![until.as_slice(), body.as_slice()],
            InstructionKind::If { then, .. } => vec![then.as_slice()],
            InstructionKind::Fixed { .. } | InstructionKind::Trailer => Vec::new(),
        }
    }

    fn children_mut(&mut self) -> Vec<&mut Vec<Instruction>> {
        match &mut self.kind {
            InstructionKind::Container { content, .. } => vec![content],
            InstructionKind::Repeat { until, body } => vec![until, body],
            InstructionKind::If { then, .. } => vec![then],
            InstructionKind::Fixed { .. } | InstructionKind::Trailer => Vec::new(),
        }
    }
}

fn assign_ids(list: &mut [Instruction], next: &mut NodeId) {
    for ins in list {
        ins.id = *next;
        *next += 1;
        for child in ins.children_mut() {
            assign_ids(child, next);
        }
    }
}

fn visit<'a>(list: &'a [Instruction], f: &mut dyn FnMut(&'a Instruction)) {
    for ins in list {
        f(ins);
        for child in ins.children() {
            visit(child, f);
        }
    }
}

impl Grammar {
    /// Builds a grammar, numbering every instruction in pre-order starting at 0.
    pub fn new(mut instructions: Vec<Instruction>, codecs: Vec<CodecDef>) -> Self {
        let mut next = 0;
        assign_ids(&mut instructions, &mut next);
        Grammar {
            instructions,
            codecs,
            node_count: next,
        }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn codecs(&self) -> &[CodecDef] {
        &self.codecs
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Pre-order traversal of every instruction.
    pub fn walk<'a>(&'a self, mut f: impl FnMut(&'a Instruction)) {
        visit(&self.instructions, &mut f);
    }

    pub fn find(&self, id: NodeId) -> Option<&Instruction> {
        let mut found = None;
        self.walk(|ins| {
            if ins.id == id {
                found = Some(ins);
            }
        });
        found
    }
}

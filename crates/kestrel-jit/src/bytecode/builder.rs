//! Builder for function bodies with forward-referenced labels

use super::{BytecodeError, FuncId, FunctionBody, Offset, Op};

/// A jump target that may be bound after it is referenced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Incrementally assembles a `FunctionBody`
pub struct BytecodeBuilder {
    name: String,
    param_count: u16,
    register_count: u16,
    code: Vec<Op>,
    labels: Vec<Option<Offset>>,
    fixups: Vec<(usize, Label)>,
}

impl BytecodeBuilder {
    pub fn new(name: impl Into<String>, param_count: u16, register_count: u16) -> Self {
        BytecodeBuilder {
            name: name.into(),
            param_count,
            register_count,
            code: Vec::new(),
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    /// Offset of the next emitted op
    pub fn here(&self) -> Offset {
        self.code.len() as Offset
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.here());
    }

    pub fn emit(&mut self, op: Op) -> Offset {
        let offset = self.here();
        self.code.push(op);
        offset
    }

    fn emit_to(&mut self, op: Op, label: Label) -> Offset {
        self.fixups.push((self.code.len(), label));
        self.emit(op)
    }

    pub fn jump(&mut self, label: Label) -> Offset {
        self.emit_to(Op::Jump { target: 0 }, label)
    }

    pub fn jump_if_true(&mut self, cond: u16, label: Label) -> Offset {
        self.emit_to(Op::JumpIfTrue { cond, target: 0 }, label)
    }

    pub fn jump_if_false(&mut self, cond: u16, label: Label) -> Offset {
        self.emit_to(Op::JumpIfFalse { cond, target: 0 }, label)
    }

    pub fn enter_try(&mut self, handler: Label) -> Offset {
        self.emit_to(Op::EnterTry { handler: 0 }, handler)
    }

    pub fn finish(mut self, id: FuncId) -> Result<FunctionBody, BytecodeError> {
        for (index, label) in std::mem::take(&mut self.fixups) {
            let target = self.labels[label.0].unwrap_or(Offset::MAX);
            match &mut self.code[index] {
                Op::Jump { target: t }
                | Op::JumpIfTrue { target: t, .. }
                | Op::JumpIfFalse { target: t, .. }
                | Op::EnterTry { handler: t } => *t = target,
                _ => {}
            }
        }
        FunctionBody::new(id, self.name, self.param_count, self.register_count, self.code)
    }
}

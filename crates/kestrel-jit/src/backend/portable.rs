//! Portable target
//!
//! A byte-encoded register machine with 16 registers and frame-relative
//! stack slots. Register 15 is reserved as scratch for legalization.

use crate::bytecode::BinaryOp;
use crate::interp::value::Value;

use super::traits::{
    CallingConvention, CodegenError, Loc, MInst, Operand, PostCheck, Target, TargetArch, TargetInfo, Watch,
};

pub const REGISTER_COUNT: u8 = 16;
const SCRATCH: u8 = REGISTER_COUNT - 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct PortableTarget;

impl PortableTarget {
    pub fn new() -> Self {
        PortableTarget
    }
}

impl Target for PortableTarget {
    fn info(&self) -> TargetInfo {
        TargetInfo {
            arch: TargetArch::Portable,
            pointer_size: 8,
        }
    }

    fn calling_convention(&self) -> CallingConvention {
        CallingConvention {
            allocatable: (0..SCRATCH).collect(),
            scratch: SCRATCH,
            save_area: REGISTER_COUNT as usize,
        }
    }

    fn legalize(&self, inst: MInst) -> Vec<MInst> {
        match inst {
            MInst::Mov {
                dst,
                src: Operand::Loc(src),
            } if dst == src => Vec::new(),
            // No memory-to-memory moves
            MInst::Mov {
                dst: dst @ Loc::Stack(_),
                src: Operand::Loc(src @ Loc::Stack(_)),
            } => vec![
                MInst::Mov {
                    dst: Loc::Reg(SCRATCH),
                    src: Operand::Loc(src),
                },
                MInst::Mov {
                    dst,
                    src: Operand::Loc(Loc::Reg(SCRATCH)),
                },
            ],
            other => vec![other],
        }
    }

    fn encode(&self, inst: &MInst, out: &mut Vec<u8>) -> Result<(), CodegenError> {
        let mut w = Writer { out };
        match inst {
            MInst::Mov { dst, src } => {
                if let (Loc::Stack(_), Operand::Loc(Loc::Stack(_))) = (dst, src) {
                    return Err(CodegenError::UnsupportedInstruction(format!("{:?}", inst)));
                }
                w.op(OP_MOV);
                w.loc(*dst);
                w.operand(src);
            }
            MInst::LoadParam { dst, index } => {
                w.op(OP_LOAD_PARAM);
                w.loc(*dst);
                w.u16(*index);
            }
            MInst::LoadIncoming { dst, reg } => {
                w.op(OP_LOAD_INCOMING);
                w.loc(*dst);
                w.u16(*reg);
            }
            MInst::LoadThis { dst } => {
                w.op(OP_LOAD_THIS);
                w.loc(*dst);
            }
            MInst::ArgCount { dst } => {
                w.op(OP_ARG_COUNT);
                w.loc(*dst);
            }
            MInst::LoadArg { dst, index } => {
                w.op(OP_LOAD_ARG);
                w.loc(*dst);
                w.operand(index);
            }
            MInst::Binary {
                op,
                dst,
                lhs,
                rhs,
                on_throw,
                post,
            } => {
                w.op(OP_BINARY);
                w.u8(binary_code(*op));
                w.loc(*dst);
                w.operand(lhs);
                w.operand(rhs);
                w.opt(*on_throw);
                w.post(*post);
            }
            MInst::IntBinary {
                op,
                dst,
                lhs,
                rhs,
                overflow,
                negzero,
            } => {
                w.op(OP_INT_BINARY);
                w.u8(binary_code(*op));
                w.loc(*dst);
                w.operand(lhs);
                w.operand(rhs);
                w.opt(*overflow);
                w.opt(*negzero);
            }
            MInst::Not { dst, src } => {
                w.op(OP_NOT);
                w.loc(*dst);
                w.operand(src);
            }
            MInst::CheckInt { value, exit } => {
                w.op(OP_CHECK_INT);
                w.operand(value);
                w.u32(*exit);
            }
            MInst::CheckShape { obj, shape, exit } => {
                w.op(OP_CHECK_SHAPE);
                w.operand(obj);
                w.u32(*shape);
                w.u32(*exit);
            }
            MInst::CheckCallTarget { callee, func, exit } => {
                w.op(OP_CHECK_CALL_TARGET);
                w.operand(callee);
                w.u32(*func);
                w.u32(*exit);
            }
            MInst::IsFunction { dst, value, func } => {
                w.op(OP_IS_FUNCTION);
                w.loc(*dst);
                w.operand(value);
                w.u32(*func);
            }
            MInst::LoadProp {
                dst,
                obj,
                name,
                on_throw,
            } => {
                w.op(OP_LOAD_PROP);
                w.loc(*dst);
                w.operand(obj);
                w.u32(*name);
                w.opt(*on_throw);
            }
            MInst::LoadSlot { dst, obj, slot } => {
                w.op(OP_LOAD_SLOT);
                w.loc(*dst);
                w.operand(obj);
                w.u32(*slot);
            }
            MInst::StoreProp {
                obj,
                name,
                value,
                on_throw,
            } => {
                w.op(OP_STORE_PROP);
                w.operand(obj);
                w.u32(*name);
                w.operand(value);
                w.opt(*on_throw);
            }
            MInst::StoreSlot { obj, slot, value } => {
                w.op(OP_STORE_SLOT);
                w.operand(obj);
                w.u32(*slot);
                w.operand(value);
            }
            MInst::DeleteProp { obj, name, on_throw } => {
                w.op(OP_DELETE_PROP);
                w.operand(obj);
                w.u32(*name);
                w.opt(*on_throw);
            }
            MInst::NewObject { dst } => {
                w.op(OP_NEW_OBJECT);
                w.loc(*dst);
            }
            MInst::Call {
                dst,
                callee,
                this,
                args,
                on_throw,
                post,
                site,
            } => {
                let argc = u16::try_from(args.len())
                    .map_err(|_| CodegenError::UnsupportedInstruction(format!("{} call arguments", args.len())))?;
                w.op(OP_CALL);
                w.loc(*dst);
                w.operand(callee);
                match this {
                    Some(t) => {
                        w.u8(1);
                        w.operand(t);
                    }
                    None => w.u8(0),
                }
                w.u16(argc);
                for a in args {
                    w.operand(a);
                }
                w.opt(*on_throw);
                w.post(*post);
                w.opt(*site);
            }
            MInst::CtorResult { dst, value, this } => {
                w.op(OP_CTOR_RESULT);
                w.loc(*dst);
                w.operand(value);
                w.operand(this);
            }
            MInst::Throw { value, on_throw } => {
                w.op(OP_THROW);
                w.operand(value);
                w.opt(*on_throw);
            }
            MInst::Jump { target } => {
                w.op(OP_JUMP);
                w.u32(*target);
            }
            MInst::Branch {
                cond,
                then_target,
                else_target,
            } => {
                w.op(OP_BRANCH);
                w.operand(cond);
                w.u32(*then_target);
                w.u32(*else_target);
            }
            MInst::Return { value } => {
                w.op(OP_RETURN);
                w.operand(value);
            }
            MInst::Exit { record } => {
                w.op(OP_EXIT);
                w.u32(*record);
            }
            MInst::Trap => w.op(OP_TRAP),
        }
        Ok(())
    }

    fn decode(&self, code: &[u8]) -> Result<Vec<MInst>, CodegenError> {
        let mut r = Reader { code, pos: 0 };
        let mut out = Vec::new();
        while !r.done() {
            let at = r.pos;
            let inst = match r.u8()? {
                OP_MOV => MInst::Mov {
                    dst: r.loc()?,
                    src: r.operand()?,
                },
                OP_LOAD_PARAM => MInst::LoadParam {
                    dst: r.loc()?,
                    index: r.u16()?,
                },
                OP_LOAD_INCOMING => MInst::LoadIncoming {
                    dst: r.loc()?,
                    reg: r.u16()?,
                },
                OP_LOAD_THIS => MInst::LoadThis { dst: r.loc()? },
                OP_ARG_COUNT => MInst::ArgCount { dst: r.loc()? },
                OP_LOAD_ARG => MInst::LoadArg {
                    dst: r.loc()?,
                    index: r.operand()?,
                },
                OP_BINARY => MInst::Binary {
                    op: r.binary()?,
                    dst: r.loc()?,
                    lhs: r.operand()?,
                    rhs: r.operand()?,
                    on_throw: r.opt()?,
                    post: r.post()?,
                },
                OP_INT_BINARY => MInst::IntBinary {
                    op: r.binary()?,
                    dst: r.loc()?,
                    lhs: r.operand()?,
                    rhs: r.operand()?,
                    overflow: r.opt()?,
                    negzero: r.opt()?,
                },
                OP_NOT => MInst::Not {
                    dst: r.loc()?,
                    src: r.operand()?,
                },
                OP_CHECK_INT => MInst::CheckInt {
                    value: r.operand()?,
                    exit: r.u32()?,
                },
                OP_CHECK_SHAPE => MInst::CheckShape {
                    obj: r.operand()?,
                    shape: r.u32()?,
                    exit: r.u32()?,
                },
                OP_CHECK_CALL_TARGET => MInst::CheckCallTarget {
                    callee: r.operand()?,
                    func: r.u32()?,
                    exit: r.u32()?,
                },
                OP_IS_FUNCTION => MInst::IsFunction {
                    dst: r.loc()?,
                    value: r.operand()?,
                    func: r.u32()?,
                },
                OP_LOAD_PROP => MInst::LoadProp {
                    dst: r.loc()?,
                    obj: r.operand()?,
                    name: r.u32()?,
                    on_throw: r.opt()?,
                },
                OP_LOAD_SLOT => MInst::LoadSlot {
                    dst: r.loc()?,
                    obj: r.operand()?,
                    slot: r.u32()?,
                },
                OP_STORE_PROP => MInst::StoreProp {
                    obj: r.operand()?,
                    name: r.u32()?,
                    value: r.operand()?,
                    on_throw: r.opt()?,
                },
                OP_STORE_SLOT => MInst::StoreSlot {
                    obj: r.operand()?,
                    slot: r.u32()?,
                    value: r.operand()?,
                },
                OP_DELETE_PROP => MInst::DeleteProp {
                    obj: r.operand()?,
                    name: r.u32()?,
                    on_throw: r.opt()?,
                },
                OP_NEW_OBJECT => MInst::NewObject { dst: r.loc()? },
                OP_CALL => {
                    let dst = r.loc()?;
                    let callee = r.operand()?;
                    let this = match r.u8()? {
                        0 => None,
                        _ => Some(r.operand()?),
                    };
                    let argc = r.u16()?;
                    let args = (0..argc).map(|_| r.operand()).collect::<Result<Vec<_>, _>>()?;
                    MInst::Call {
                        dst,
                        callee,
                        this,
                        args,
                        on_throw: r.opt()?,
                        post: r.post()?,
                        site: r.opt()?,
                    }
                }
                OP_CTOR_RESULT => MInst::CtorResult {
                    dst: r.loc()?,
                    value: r.operand()?,
                    this: r.operand()?,
                },
                OP_THROW => MInst::Throw {
                    value: r.operand()?,
                    on_throw: r.opt()?,
                },
                OP_JUMP => MInst::Jump { target: r.u32()? },
                OP_BRANCH => MInst::Branch {
                    cond: r.operand()?,
                    then_target: r.u32()?,
                    else_target: r.u32()?,
                },
                OP_RETURN => MInst::Return { value: r.operand()? },
                OP_EXIT => MInst::Exit { record: r.u32()? },
                OP_TRAP => MInst::Trap,
                _ => return Err(CodegenError::Decode(at)),
            };
            out.push(inst);
        }
        Ok(out)
    }
}

const OP_MOV: u8 = 0x01;
const OP_LOAD_PARAM: u8 = 0x02;
const OP_LOAD_INCOMING: u8 = 0x03;
const OP_LOAD_THIS: u8 = 0x04;
const OP_ARG_COUNT: u8 = 0x05;
const OP_LOAD_ARG: u8 = 0x06;
const OP_BINARY: u8 = 0x10;
const OP_INT_BINARY: u8 = 0x11;
const OP_NOT: u8 = 0x12;
const OP_CHECK_INT: u8 = 0x20;
const OP_CHECK_SHAPE: u8 = 0x21;
const OP_CHECK_CALL_TARGET: u8 = 0x22;
const OP_IS_FUNCTION: u8 = 0x23;
const OP_LOAD_PROP: u8 = 0x30;
const OP_LOAD_SLOT: u8 = 0x31;
const OP_STORE_PROP: u8 = 0x32;
const OP_STORE_SLOT: u8 = 0x33;
const OP_DELETE_PROP: u8 = 0x34;
const OP_NEW_OBJECT: u8 = 0x35;
const OP_CALL: u8 = 0x40;
const OP_CTOR_RESULT: u8 = 0x41;
const OP_THROW: u8 = 0x42;
const OP_JUMP: u8 = 0x50;
const OP_BRANCH: u8 = 0x51;
const OP_RETURN: u8 = 0x52;
const OP_EXIT: u8 = 0x60;
const OP_TRAP: u8 = 0xFF;

const BINARY_OPS: [BinaryOp; 8] = [
    BinaryOp::Add,
    BinaryOp::Sub,
    BinaryOp::Mul,
    BinaryOp::Div,
    BinaryOp::BitOr,
    BinaryOp::Lt,
    BinaryOp::Le,
    BinaryOp::StrictEq,
];

fn binary_code(op: BinaryOp) -> u8 {
    BINARY_OPS.iter().position(|o| *o == op).unwrap_or(0) as u8
}

struct Writer<'a> {
    out: &'a mut Vec<u8>,
}

impl Writer<'_> {
    fn op(&mut self, code: u8) {
        self.out.push(code);
    }

    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn loc(&mut self, loc: Loc) {
        match loc {
            Loc::Reg(r) => {
                self.u8(0);
                self.u8(r);
            }
            Loc::Stack(s) => {
                self.u8(1);
                self.u16(s);
            }
        }
    }

    fn operand(&mut self, op: &Operand) {
        match op {
            Operand::Loc(loc) => self.loc(*loc),
            Operand::Imm(v) => {
                self.u8(2);
                self.out.extend_from_slice(&v.bits().to_le_bytes());
            }
        }
    }

    fn opt(&mut self, v: Option<u32>) {
        match v {
            Some(t) => {
                self.u8(1);
                self.u32(t);
            }
            None => self.u8(0),
        }
    }

    fn post(&mut self, post: Option<PostCheck>) {
        match post {
            None => self.u8(0),
            Some(p) => {
                self.u8(match p.watch {
                    Watch::ImplicitCalls => 1,
                    Watch::ShapeEpoch => 2,
                });
                self.u32(p.exit);
            }
        }
    }
}

struct Reader<'a> {
    code: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn done(&self) -> bool {
        self.pos >= self.code.len()
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodegenError> {
        let bytes = self
            .code
            .get(self.pos..self.pos + N)
            .ok_or(CodegenError::Truncated(self.pos))?;
        self.pos += N;
        let mut buf = [0u8; N];
        buf.copy_from_slice(bytes);
        Ok(buf)
    }

    fn u8(&mut self) -> Result<u8, CodegenError> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, CodegenError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> Result<u32, CodegenError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    fn binary(&mut self) -> Result<BinaryOp, CodegenError> {
        let at = self.pos;
        let code = self.u8()?;
        BINARY_OPS
            .get(code as usize)
            .copied()
            .ok_or(CodegenError::Decode(at))
    }

    fn loc(&mut self) -> Result<Loc, CodegenError> {
        let at = self.pos;
        match self.u8()? {
            0 => Ok(Loc::Reg(self.u8()?)),
            1 => Ok(Loc::Stack(self.u16()?)),
            _ => Err(CodegenError::Decode(at)),
        }
    }

    fn operand(&mut self) -> Result<Operand, CodegenError> {
        let at = self.pos;
        match self.u8()? {
            0 => Ok(Operand::Loc(Loc::Reg(self.u8()?))),
            1 => Ok(Operand::Loc(Loc::Stack(self.u16()?))),
            2 => Ok(Operand::Imm(Value::from_bits(u64::from_le_bytes(self.take()?)))),
            _ => Err(CodegenError::Decode(at)),
        }
    }

    fn opt(&mut self) -> Result<Option<u32>, CodegenError> {
        match self.u8()? {
            0 => Ok(None),
            _ => Ok(Some(self.u32()?)),
        }
    }

    fn post(&mut self) -> Result<Option<PostCheck>, CodegenError> {
        let at = self.pos;
        let watch = match self.u8()? {
            0 => return Ok(None),
            1 => Watch::ImplicitCalls,
            2 => Watch::ShapeEpoch,
            _ => return Err(CodegenError::Decode(at)),
        };
        Ok(Some(PostCheck {
            exit: self.u32()?,
            watch,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(insts: Vec<MInst>) -> Vec<MInst> {
        let target = PortableTarget::new();
        let mut code = Vec::new();
        for inst in &insts {
            target.encode(inst, &mut code).unwrap();
        }
        target.decode(&code).unwrap()
    }

    #[test]
    fn test_encode_decode() {
        let insts = vec![
            MInst::LoadParam {
                dst: Loc::Reg(0),
                index: 1,
            },
            MInst::IntBinary {
                op: BinaryOp::Mul,
                dst: Loc::Stack(3),
                lhs: Operand::Loc(Loc::Reg(0)),
                rhs: Operand::Imm(Value::int(-7)),
                overflow: Some(4),
                negzero: None,
            },
            MInst::Call {
                dst: Loc::Reg(2),
                callee: Operand::Imm(Value::function(crate::bytecode::FuncId(3))),
                this: Some(Operand::Imm(Value::UNDEFINED)),
                args: vec![Operand::Loc(Loc::Stack(3)), Operand::Imm(Value::float(0.5))],
                on_throw: None,
                post: Some(PostCheck {
                    exit: 4,
                    watch: Watch::ShapeEpoch,
                }),
                site: Some(7),
            },
            MInst::Return {
                value: Operand::Loc(Loc::Reg(2)),
            },
            MInst::Exit { record: 0 },
        ];
        assert_eq!(round_trip(insts.clone()), insts);
    }

    #[test]
    fn test_legalize_memory_move() {
        let target = PortableTarget::new();
        let mov = MInst::Mov {
            dst: Loc::Stack(0),
            src: Operand::Loc(Loc::Stack(1)),
        };
        let mut out = Vec::new();
        assert!(target.encode(&mov, &mut out).is_err());
        let legal = target.legalize(mov);
        assert_eq!(legal.len(), 2);
        for inst in &legal {
            target.encode(inst, &mut out).unwrap();
        }
        let self_move = MInst::Mov {
            dst: Loc::Reg(1),
            src: Operand::Loc(Loc::Reg(1)),
        };
        assert!(target.legalize(self_move).is_empty());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let target = PortableTarget::new();
        assert!(matches!(target.decode(&[0x7E]), Err(CodegenError::Decode(0))));
        assert!(matches!(target.decode(&[OP_JUMP, 1]), Err(CodegenError::Truncated(1))));
    }
}

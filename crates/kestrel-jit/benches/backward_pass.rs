use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use kestrel_jit::analysis::backward::BackwardPass;
use kestrel_jit::bytecode::builder::BytecodeBuilder;
use kestrel_jit::bytecode::{BinaryOp, FuncId, Op, Program};
use kestrel_jit::config::JitConfig;
use kestrel_jit::ir::{EntryKind, IrFunc};
use kestrel_jit::pipeline::context::CompileContext;
use kestrel_jit::pipeline::lifter::lift_function;
use kestrel_jit::profiling::{ProgramProfile, Tier};
use kestrel_jit::runtime::OverrideSnapshot;

/// `ops` int additions over two parameters, every third one a dead store
fn straight_line(ops: u32) -> (Program, ProgramProfile) {
    let mut b = BytecodeBuilder::new("chain", 2, 6);
    for i in 0..ops {
        let dst = if i % 3 == 0 { 5 } else { 2 + (i % 3) as u16 };
        b.emit(Op::Binary {
            op: BinaryOp::Add,
            dst,
            lhs: (i % 2) as u16,
            rhs: 2 + ((i + 1) % 2) as u16,
        });
    }
    b.emit(Op::Return { src: 2 });
    let program = Program::new(vec![b.finish(FuncId(0)).unwrap()], vec![]).unwrap();
    let profiles = ProgramProfile::new(1);
    profiles.functions[0].with_data(|d| {
        for offset in 0..ops {
            d.record_arith(offset, true);
        }
    });
    (program, profiles)
}

fn lift(program: &Program, profiles: &ProgramProfile, config: &JitConfig, overrides: &OverrideSnapshot) -> IrFunc {
    let mut ctx = CompileContext::new(program, profiles, config, overrides, Tier::Full);
    lift_function(&mut ctx, FuncId(0), EntryKind::Function).unwrap()
}

fn bench_backward_pass(c: &mut Criterion) {
    let mut group = c.benchmark_group("backward_pass");
    let config = JitConfig::default();
    let overrides = OverrideSnapshot::default();

    for ops in [16u32, 128, 1024] {
        let (program, profiles) = straight_line(ops);
        group.bench_with_input(BenchmarkId::new("straight_line", ops), &ops, |b, _| {
            b.iter_batched(
                || lift(&program, &profiles, &config, &overrides),
                |mut ir| {
                    let mut ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Full);
                    black_box(BackwardPass::new(&mut ctx).run(&mut ir).unwrap())
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_backward_pass);
criterion_main!(benches);

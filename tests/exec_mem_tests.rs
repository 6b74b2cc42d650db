use irjit::core::Counter;
use irjit::object_file::write_elf;
use irjit::{CompileError, ExecArena, InsnSeq, Jit, JitOptions, Opnd, OwnerId};
use object::{Object, ObjectSection, ObjectSymbol};
use std::sync::Arc;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn test_concurrent_commits_get_disjoint_regions() {
    init();
    let arena = Arc::new(ExecArena::new(1 << 20).unwrap());
    let handles: Vec<_> = (0..8u8)
        .map(|t| {
            let arena = Arc::clone(&arena);
            std::thread::spawn(move || {
                (0..4u8)
                    .map(|i| {
                        let code = vec![0x90 ^ t, i, 0xC3];
                        let region = arena.commit(&code).unwrap();
                        assert_eq!(arena.read(&region), code);
                        region
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut starts: Vec<usize> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .map(|r| r.start().addr())
        .collect();
    starts.sort_unstable();
    starts.dedup();
    assert_eq!(starts.len(), 32);
    assert!(arena.used() >= 32 * 3);
}

fn filler() -> InsnSeq {
    let mut seq = InsnSeq::new();
    seq.comment("filler").unwrap();
    for _ in 0..64 {
        let next = seq.add(Opnd::SP, Opnd::imm(8)).unwrap();
        seq.mov(Opnd::SP, next).unwrap();
    }
    seq.ret().unwrap();
    seq
}

#[test]
fn test_exhausted_arena_fails_compilation() {
    init();
    let jit = Jit::new(JitOptions {
        exec_mem_size_mib: 1,
        gen_stats: true,
        ..JitOptions::default()
    })
    .unwrap();

    let mut committed = 0;
    let err = loop {
        match jit.compile(OwnerId(1), filler(), vec![]) {
            Ok(_) => committed += 1,
            Err(e) => break e,
        }
        assert!(committed <= jit.arena().capacity(), "arena never filled");
    };

    assert!(matches!(err, CompileError::AllocationExhaustion { .. }), "{err}");
    assert!(err.falls_back_to_interpreter());
    assert_eq!(jit.stats().get(Counter::CompiledUnits), committed as u64);
    assert_eq!(jit.stats().get(Counter::ArenaExhausted), 1);

    let used = jit.arena().used();
    assert!(jit.compile(OwnerId(1), filler(), vec![]).is_err());
    assert_eq!(jit.arena().used(), used);
}

#[test]
fn test_elf_export_contains_unit() {
    init();
    let asm = irjit::assemble(filler(), &irjit::Stats::new(false)).unwrap();
    let bytes = write_elf("filler_unit", &asm.code).unwrap();

    let file = object::File::parse(&*bytes).unwrap();
    let text = file.section_by_name(".text").unwrap();
    assert_eq!(text.data().unwrap(), &asm.code[..]);
    let sym = file.symbols().find(|s| s.name() == Ok("filler_unit")).unwrap();
    assert_eq!(sym.size(), asm.code.len() as u64);
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
#[test]
fn test_committed_bytes_execute() {
    init();
    let arena = ExecArena::new(4096).unwrap();
    // mov eax, 42; ret
    let region = arena.commit(&[0xB8, 42, 0, 0, 0, 0xC3]).unwrap();
    let f: extern "C" fn() -> i32 =
        unsafe { std::mem::transmute(region.start().addr() as *const u8) };
    assert_eq!(f(), 42);
}

//! Integration tests for probe creation, patching and teardown.

use std::sync::Arc;

use axfbt::sim::{SimMemory, SimModules, SimTypes};
use axfbt::{
    Arch, Error, EventQueue, FbtConfig, FbtProvider, HostEnv, ModuleId, ModuleState, ProbeId,
    ProbeKind, ProbeState, SymbolList,
};

const MODULE: ModuleId = ModuleId(7);
const TEXT: usize = 0x40_0000;

/// Two functions: `alpha` with two returns, `beta` with one.
fn module_text() -> (Vec<u8>, SymbolList) {
    let alpha = [
        0x55, 0x48, 0x89, 0xe5, 0x85, 0xff, 0x74, 0x02, 0x5d, 0xc3, 0xb8, 0x01, 0x00, 0x00, 0x00,
        0x5d, 0xc3,
    ];
    let beta = [0x55, 0x48, 0x89, 0xe5, 0x5d, 0xc3];

    let mut text = alpha.to_vec();
    text.resize(0x20, 0x90);
    text.extend_from_slice(&beta);

    let symbols = SymbolList::new()
        .with("alpha", TEXT, alpha.len(), 'T')
        .with("beta", TEXT + 0x20, beta.len(), 't');
    (text, symbols)
}

struct Rig {
    fbt: &'static FbtProvider,
    engine: Arc<EventQueue>,
    memory: Arc<SimMemory>,
    modules: Arc<SimModules>,
}

fn rig_with(config: FbtConfig, types: Option<Arc<SimTypes>>) -> Rig {
    let (text, symbols) = module_text();
    let memory = Arc::new(SimMemory::new(Arch::X86_64));
    memory.map(TEXT, &text);

    let modules = Arc::new(SimModules::new());
    modules.insert(MODULE, "testmod", symbols);

    let engine = Arc::new(EventQueue::new());
    let mut env = HostEnv::new(modules.clone(), memory.clone(), engine.clone());
    if let Some(types) = types {
        env = env.with_types(types);
    }
    let config = config.with_arch(Arch::X86_64);
    let fbt: &'static FbtProvider = Box::leak(Box::new(FbtProvider::new(config, env).unwrap()));
    fbt.attach().unwrap();

    Rig {
        fbt,
        engine,
        memory,
        modules,
    }
}

fn rig() -> Rig {
    rig_with(FbtConfig::new().with_max_probes(64), None)
}

fn probe(r: &Rig, function: &str) -> ProbeId {
    r.engine.probe_by_name("testmod", function).unwrap()
}

fn alpha_sites() -> [usize; 3] {
    [TEXT, TEXT + 9, TEXT + 16]
}

// =============================================================================
// Provide Tests
// =============================================================================

#[test]
fn test_provide_creates_one_probe_per_function() {
    let r = rig();
    let stats = r.fbt.provide(MODULE).unwrap();
    assert_eq!(stats.functions, 2);
    assert_eq!(stats.entry_probes, 2);
    assert_eq!(stats.return_probes, 3);
    assert_eq!(r.fbt.table().len(), 5);
    assert_eq!(r.fbt.module_probe_count(MODULE), 5);

    let probes = r.engine.probes();
    assert_eq!(probes.len(), 2);
    assert!(probes.iter().all(|p| p.kind == ProbeKind::Entry && p.aframes == 3));

    let alpha = probe(&r, "alpha");
    let infos = r.fbt.list_probes();
    let alpha_infos: Vec<_> = infos.iter().filter(|p| p.function == "alpha").collect();
    assert_eq!(alpha_infos.len(), 3);
    assert!(alpha_infos.iter().all(|p| p.id == alpha && p.module == "testmod"));
    assert_eq!(
        alpha_infos.iter().map(|p| p.roffset).collect::<Vec<_>>(),
        vec![0, 9, 16]
    );
}

#[test]
fn test_provide_twice_is_refused() {
    let r = rig();
    r.fbt.provide(MODULE).unwrap();
    assert_eq!(
        r.fbt.provide(MODULE).unwrap_err(),
        Error::AlreadyProvided("testmod".into())
    );
    assert_eq!(r.fbt.table().len(), 5);
}

#[test]
fn test_excluded_and_unknown_modules() {
    let r = rig_with(FbtConfig::new().with_excluded_modules(&["testmod"]), None);
    assert_eq!(
        r.fbt.provide(MODULE).unwrap_err(),
        Error::Excluded("testmod".into())
    );
    assert_eq!(r.fbt.provide(ModuleId(99)).unwrap_err(), Error::UnknownModule(99));
    assert!(r.fbt.table().is_empty());
}

#[test]
fn test_empty_symbol_table_yields_nothing() {
    let r = rig();
    r.modules.set_symbols(MODULE, SymbolList::new());
    let stats = r.fbt.provide(MODULE).unwrap();
    assert_eq!(stats.probes(), 0);
    assert!(r.engine.probes().is_empty());
}

/// `alpha` and `beta` with a symbol claiming an absurd size in between.
fn with_bloated(size: usize) -> SymbolList {
    let (_, symbols) = module_text();
    let mut out = SymbolList::new();
    for (i, sym) in symbols.iter().enumerate() {
        if i == 1 {
            out = out.with("bloated", TEXT + 0x100, size, 'T');
        }
        out.push(sym.clone());
    }
    out
}

#[test]
fn test_oversized_symbol_is_skipped() {
    let r = rig();
    r.modules.set_symbols(MODULE, with_bloated(usize::MAX / 2));

    let stats = r.fbt.provide(MODULE).unwrap();
    assert_eq!(stats.functions, 3);
    assert_eq!(stats.unreadable, 1);
    assert_eq!(stats.entry_probes, 2);
    assert_eq!(stats.return_probes, 3);
    assert!(r.engine.probe_by_name("testmod", "beta").is_some());
}

#[test]
fn test_unbufferable_symbol_counts_as_alloc_failure() {
    let r = rig_with(
        FbtConfig::new()
            .with_max_probes(64)
            .with_max_function_size(usize::MAX),
        None,
    );
    r.modules.set_symbols(MODULE, with_bloated(usize::MAX));

    let stats = r.fbt.provide(MODULE).unwrap();
    assert_eq!(stats.alloc_failures, 1);
    assert_eq!(stats.entry_probes, 2);
    assert!(r.engine.probe_by_name("testmod", "bloated").is_none());
    assert!(r.engine.probe_by_name("testmod", "beta").is_some());
}

#[test]
fn test_capacity_exhaustion_drops_probes() {
    let r = rig_with(FbtConfig::new().with_max_probes(4), None);
    let stats = r.fbt.provide(MODULE).unwrap();
    // alpha takes three slots, beta gets its entry only
    assert_eq!(stats.entry_probes, 2);
    assert_eq!(stats.return_probes, 2);
    assert_eq!(stats.alloc_failures, 1);
    assert_eq!(r.fbt.table().len(), 4);
}

// =============================================================================
// Enable / Disable Tests
// =============================================================================

#[test]
fn test_enable_patches_whole_chain() {
    let r = rig();
    r.fbt.provide(MODULE).unwrap();
    let alpha = probe(&r, "alpha");

    r.engine.enable(alpha).unwrap();
    for addr in alpha_sites() {
        assert_eq!(r.memory.byte(addr), Some(0xcc));
    }
    // beta untouched
    assert_eq!(r.memory.byte(TEXT + 0x20), Some(0x55));
    assert_eq!(r.memory.write_count(), 3);
    assert!(r
        .fbt
        .list_probes()
        .iter()
        .filter(|p| p.id == alpha)
        .all(|p| p.state == ProbeState::Enabled));
}

#[test]
fn test_patch_round_trip_restores_text() {
    let r = rig();
    let (text, _) = module_text();
    r.fbt.provide(MODULE).unwrap();
    let ids = [probe(&r, "alpha"), probe(&r, "beta")];

    for _ in 0..100 {
        for id in ids {
            r.engine.enable(id).unwrap();
        }
        for id in ids {
            r.engine.disable(id).unwrap();
        }
    }
    assert_eq!(r.memory.bytes(TEXT, text.len()).unwrap(), text);
    assert_eq!(r.memory.write_count(), 100 * 2 * 5);
}

#[test]
fn test_suspend_and_resume() {
    let r = rig();
    let (text, _) = module_text();
    r.fbt.provide(MODULE).unwrap();
    let alpha = probe(&r, "alpha");

    r.engine.enable(alpha).unwrap();
    r.engine.suspend(alpha).unwrap();
    assert_eq!(r.memory.bytes(TEXT, 17).unwrap(), text[..17].to_vec());
    assert!(r
        .fbt
        .list_probes()
        .iter()
        .filter(|p| p.id == alpha)
        .all(|p| p.state == ProbeState::Suspended));

    r.engine.resume(alpha).unwrap();
    for addr in alpha_sites() {
        assert_eq!(r.memory.byte(addr), Some(0xcc));
    }
}

#[test]
fn test_reloaded_module_is_not_patched() {
    let r = rig();
    r.fbt.provide(MODULE).unwrap();
    let alpha = probe(&r, "alpha");
    let head = r.engine.probe(alpha).unwrap().handle;

    r.modules.reload(MODULE);
    assert_eq!(
        r.fbt.enable_probe(head),
        Err(Error::ModuleReloaded("alpha".into()))
    );
    r.engine.enable(alpha).unwrap();
    assert_eq!(r.memory.write_count(), 0);
    assert_eq!(r.memory.byte(TEXT), Some(0x55));
}

#[test]
fn test_unloaded_module_is_not_touched() {
    let r = rig_with(FbtConfig::new().with_verbose(true), None);
    r.fbt.provide(MODULE).unwrap();
    let alpha = probe(&r, "alpha");
    r.engine.enable(alpha).unwrap();
    assert_eq!(r.memory.write_count(), 3);

    r.modules.set_state(MODULE, ModuleState::Going);
    let head = r.engine.probe(alpha).unwrap().handle;
    assert_eq!(
        r.fbt.disable_probe(head),
        Err(Error::ModuleNotLive("alpha".into()))
    );
    assert_eq!(r.fbt.suspend_probe(head).unwrap_err(), Error::ModuleNotLive("alpha".into()));
    assert_eq!(r.memory.write_count(), 3);
}

#[test]
fn test_write_failure_is_tolerated() {
    let r = rig();
    r.fbt.provide(MODULE).unwrap();
    let head = r.engine.probe(probe(&r, "alpha")).unwrap().handle;

    r.memory.set_read_only(TEXT, true);
    assert_eq!(r.fbt.enable_probe(head), Ok(0));
    assert_eq!(r.memory.byte(TEXT), Some(0x55));
}

// =============================================================================
// Destroy Tests
// =============================================================================

#[test]
fn test_destroy_removes_every_address() {
    let r = rig();
    r.fbt.provide(MODULE).unwrap();
    let alpha = probe(&r, "alpha");
    let head = r.engine.probe(alpha).unwrap().handle;

    assert_eq!(r.fbt.destroy_probe(head), 3);
    for addr in alpha_sites() {
        assert!(!r.fbt.table().contains(addr));
    }
    assert!(r.fbt.table().contains(TEXT + 0x20));
    assert_eq!(r.fbt.module_probe_count(MODULE), 2);

    // already destroyed
    assert_eq!(r.fbt.destroy_probe(head), 0);
    assert_eq!(r.fbt.enable_probe(head), Err(Error::StaleProbe));
}

#[test]
fn test_destroy_restores_patched_text() {
    let r = rig();
    let (text, _) = module_text();
    r.fbt.provide(MODULE).unwrap();
    let alpha = probe(&r, "alpha");
    r.engine.enable(alpha).unwrap();

    r.engine.destroy(alpha).unwrap();
    assert_eq!(r.memory.bytes(TEXT, 17).unwrap(), text[..17].to_vec());
}

#[test]
fn test_destroy_after_unload_skips_text() {
    let r = rig();
    r.fbt.provide(MODULE).unwrap();
    let alpha = probe(&r, "alpha");
    r.engine.enable(alpha).unwrap();

    r.modules.unload(MODULE);
    r.engine.destroy(alpha).unwrap();
    assert_eq!(r.memory.write_count(), 3);
    assert!(!r.fbt.table().contains(TEXT));
}

#[test]
fn test_reload_allows_new_records() {
    let r = rig();
    r.fbt.provide(MODULE).unwrap();
    for p in r.engine.probes() {
        r.engine.destroy(p.id).unwrap();
    }
    assert!(r.fbt.table().is_empty());

    r.modules.reload(MODULE);
    let stats = r.fbt.provide(MODULE).unwrap();
    assert_eq!(stats.probes(), 5);
    r.engine.enable(probe(&r, "beta")).unwrap();
    assert_eq!(r.memory.byte(TEXT + 0x20), Some(0xcc));
}

// =============================================================================
// Argument Description Tests
// =============================================================================

#[test]
fn test_arg_desc_with_types() {
    let types = Arc::new(SimTypes::new());
    types.insert(MODULE, 0, "long", &["int", "const char *"]);
    let r = rig_with(FbtConfig::new(), Some(types));
    r.fbt.provide(MODULE).unwrap();
    let alpha = probe(&r, "alpha");

    assert_eq!(r.engine.arg_desc(alpha, ProbeKind::Entry, 0).as_deref(), Some("int"));
    assert_eq!(
        r.engine.arg_desc(alpha, ProbeKind::Entry, 1).as_deref(),
        Some("const char *")
    );
    assert_eq!(r.engine.arg_desc(alpha, ProbeKind::Entry, 2), None);
    assert_eq!(r.engine.arg_desc(alpha, ProbeKind::Return, 0).as_deref(), Some("int"));
    assert_eq!(r.engine.arg_desc(alpha, ProbeKind::Return, 1).as_deref(), Some("long"));
    assert_eq!(r.engine.arg_desc(alpha, ProbeKind::Return, 2), None);

    // no type data for beta
    let beta = probe(&r, "beta");
    assert_eq!(r.engine.arg_desc(beta, ProbeKind::Entry, 0), None);
}

#[test]
fn test_arg_desc_without_types_or_module() {
    let r = rig();
    r.fbt.provide(MODULE).unwrap();
    let alpha = probe(&r, "alpha");
    assert_eq!(r.engine.arg_desc(alpha, ProbeKind::Entry, 0), None);
    assert_eq!(r.engine.arg_desc(alpha, ProbeKind::Return, 0).as_deref(), Some("int"));

    r.modules.reload(MODULE);
    assert_eq!(r.engine.arg_desc(alpha, ProbeKind::Return, 0), None);
}

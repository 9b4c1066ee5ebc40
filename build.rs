use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;

#[derive(Deserialize, Default)]
struct ConfigSection {
    page_size: Option<usize>,
    zero_on_free: Option<bool>,
    write_after_free_check: Option<bool>,
    slab_canary: Option<bool>,
    slot_randomize: Option<bool>,
    guard_slabs: Option<bool>,
    max_empty_slabs_total: Option<usize>,
    mremap_threshold: Option<usize>,
}

#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    config: ConfigSection,
    #[serde(default, rename = "class")]
    classes: Vec<ClassDef>,
}

#[derive(Deserialize)]
struct ClassDef {
    size: usize,
    slots: usize,
}

struct ResolvedConfig {
    page_size: usize,
    page_shift: u32,
    zero_on_free: bool,
    write_after_free_check: bool,
    slab_canary: bool,
    slot_randomize: bool,
    guard_slabs: bool,
    max_empty_slabs_total: usize,
    mremap_threshold: usize,
}

fn resolve_config(cfg: &ConfigSection) -> ResolvedConfig {
    let page_size = cfg.page_size.unwrap_or(4096);
    assert!(
        page_size == 4096,
        "page_size ({}) must be 4096: the slot bitmap and slab arithmetic assume 4 KiB pages",
        page_size
    );

    let zero_on_free = cfg.zero_on_free.unwrap_or(true);
    let write_after_free_check = cfg.write_after_free_check.unwrap_or(true);
    assert!(
        !write_after_free_check || zero_on_free,
        "write_after_free_check requires zero_on_free"
    );

    let max_empty_slabs_total = cfg.max_empty_slabs_total.unwrap_or(64 * 1024);
    let mremap_threshold = cfg.mremap_threshold.unwrap_or(4 * 1024 * 1024);
    assert!(max_empty_slabs_total > 0, "max_empty_slabs_total must be > 0");
    assert!(
        mremap_threshold > 16384,
        "mremap_threshold ({}) must be larger than the slab range",
        mremap_threshold
    );

    ResolvedConfig {
        page_size,
        page_shift: page_size.trailing_zeros(),
        zero_on_free,
        write_after_free_check,
        slab_canary: cfg.slab_canary.unwrap_or(true),
        slot_randomize: cfg.slot_randomize.unwrap_or(true),
        guard_slabs: cfg.guard_slabs.unwrap_or(true),
        max_empty_slabs_total,
        mremap_threshold,
    }
}

fn validate_classes(defs: &[ClassDef]) {
    assert!(
        defs.len() >= 10,
        "RHMALLOC_CONFIG: need the zero class plus at least the 16..=128 classes"
    );
    assert!(
        defs.len() < 64,
        "RHMALLOC_CONFIG: too many classes ({}, max 63)",
        defs.len()
    );
    assert_eq!(defs[0].size, 0, "class 0 must be the zero-byte class");
    for (i, d) in defs.iter().enumerate() {
        assert!(d.slots > 0, "class {}: slots must be > 0", i);
        if i == 0 {
            continue;
        }
        assert!(
            d.size % 16 == 0,
            "class {}: size {} must be a multiple of 16",
            i,
            d.size
        );
        assert!(
            d.size > defs[i - 1].size,
            "class {}: size {} must be > previous size {}",
            i,
            d.size,
            defs[i - 1].size
        );
        // the <= 128 lookup fast path depends on 16-byte steps for classes 1..=8
        if i <= 8 {
            assert_eq!(
                d.size,
                i * 16,
                "class {}: sizes up to 128 must advance in 16-byte steps",
                i
            );
        }
    }
    let max = defs.last().unwrap().size;
    assert!(
        max == 16384,
        "RHMALLOC_CONFIG: largest class must be 16384, got {}",
        max
    );
}

fn default_config_path() -> String {
    let manifest_dir = env::var("CARGO_MANIFEST_DIR").unwrap();
    format!("{}/rhmalloc.toml", manifest_dir)
}

fn generate_config(cfg: &ResolvedConfig, out_path: &Path) {
    let code = format!(
        "// Auto-generated by build.rs. Do not edit.\n\n\
         pub const PAGE_SHIFT: usize = {};\n\
         pub const PAGE_SIZE: usize = {};\n\
         pub const ZERO_ON_FREE: bool = {};\n\
         pub const WRITE_AFTER_FREE_CHECK: bool = {};\n\
         pub const SLAB_CANARY: bool = {};\n\
         pub const SLOT_RANDOMIZE: bool = {};\n\
         pub const GUARD_SLABS: bool = {};\n\
         pub const MAX_EMPTY_SLABS_TOTAL: usize = {};\n\
         pub const MREMAP_THRESHOLD: usize = {};\n",
        cfg.page_shift,
        cfg.page_size,
        cfg.zero_on_free,
        cfg.write_after_free_check,
        cfg.slab_canary,
        cfg.slot_randomize,
        cfg.guard_slabs,
        cfg.max_empty_slabs_total,
        cfg.mremap_threshold,
    );
    fs::write(out_path, code).expect("failed to write config_gen.rs");
}

fn generate_size_classes(defs: &[ClassDef], out_path: &Path) {
    let mut code = String::from("// Auto-generated by build.rs. Do not edit.\n\n");

    code.push_str(&format!(
        "pub const N_SIZE_CLASSES: usize = {};\n\n",
        defs.len()
    ));
    code.push_str(&format!(
        "pub static SIZE_CLASSES: [SizeClassInfo; {}] = [\n",
        defs.len()
    ));
    for d in defs {
        code.push_str(&format!(
            "    SizeClassInfo {{ size: {}, slots: {} }},\n",
            d.size, d.slots
        ));
    }
    code.push_str("];\n");

    fs::write(out_path, code).expect("failed to write size_class_gen.rs");
}

fn main() {
    println!("cargo:rerun-if-env-changed=RHMALLOC_CONFIG");

    let out_dir = env::var("OUT_DIR").unwrap();

    let config_path = env::var("RHMALLOC_CONFIG").unwrap_or_else(|_| default_config_path());
    println!("cargo:rerun-if-changed={}", config_path);
    let content = fs::read_to_string(&config_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", config_path, e));

    let config: Config = toml::from_str(&content).expect("failed to parse TOML config");

    let resolved = resolve_config(&config.config);
    validate_classes(&config.classes);

    generate_config(&resolved, &Path::new(&out_dir).join("config_gen.rs"));
    generate_size_classes(&config.classes, &Path::new(&out_dir).join("size_class_gen.rs"));
}

// Tests against the running kernel.
//
// These need root (BTF, setrlimit and BPF), so they are marked as ignored by
// default. Run with:
//
//   sudo cargo test --test kernel -- --ignored

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::process::Command;

    use nfstrace::btf_funcs::{select_functions, BtfSource};
    use nfstrace::kallsyms::{SymbolCatalog, UNKNOWN_SYMBOL};

    #[test]
    #[ignore] // Requires kernel BTF
    fn test_selects_nfs_functions_from_kernel_btf() {
        let source = BtfSource::new(
            Path::new("/sys/kernel/btf/vmlinux"),
            Path::new("/sys/kernel/btf"),
        )
        .expect("Failed to load kernel BTF");
        let modules = vec!["nfs".to_string()];
        let selected = select_functions(&source, "nfs_.*", "nfs_pgio_header", &modules)
            .expect("Selection failed");
        for target in selected.values() {
            assert!(target.function.starts_with("nfs_"));
            assert!((1..=5).contains(&target.arg_position));
        }
    }

    #[test]
    #[ignore] // Requires root to read real kallsyms addresses
    fn test_kallsyms_resolves_known_symbol() {
        let catalog =
            SymbolCatalog::load(Path::new("/proc/kallsyms")).expect("Failed to read kallsyms");
        assert!(!catalog.is_empty());
        assert_ne!(catalog.find_nearest(u64::MAX), UNKNOWN_SYMBOL);
    }

    #[test]
    #[ignore] // Requires root and kernel BTF
    fn test_skip_attach_exits_cleanly() {
        let output = Command::new(env!("CARGO_BIN_EXE_nfstrace"))
            .args(["--skip-attach", "--filter-func", "nfs_.*", "-vv"])
            .output()
            .expect("Failed to run nfstrace");

        assert!(
            output.status.success(),
            "nfstrace should exit successfully: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        assert!(output.stdout.is_empty(), "no facts without attaching");
    }
}

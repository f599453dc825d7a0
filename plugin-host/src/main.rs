// plugin-host/src/main.rs
// Minimal demonstration host: load every library named on the command line,
// report what each one provided, then print the loader's summary. Set
// RUST_LOG=debug to watch the registration protocol at work.

use plugin_registry::Loader;

fn main() {
    env_logger::init();

    let mut loader = Loader::new();
    for path in std::env::args().skip(1) {
        let names = loader.load_library(&path);
        if names.is_empty() {
            println!("{path}: no plugins");
        } else {
            let names: Vec<String> = names.into_iter().collect();
            println!("{path}: {}", names.join(", "));
        }
    }

    print!("{}", loader.pretty_print());

    for name in loader.all_plugins() {
        let handle = loader.instantiate(&name);
        if !handle.is_empty() {
            log::info!("instantiated `{name}`");
        }
    }
}

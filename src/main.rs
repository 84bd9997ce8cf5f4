use krypton::{KryptonConfig, SessionCrypto};

fn main() {
    tracing_subscriber::fmt::init();

    println!("Krypton Session Controller");
    println!("==========================\n");

    // Load configuration from standard search paths
    println!("1. Loading configuration...");
    println!("   Search paths (in priority order, lowest to highest):");
    for path in KryptonConfig::search_paths() {
        let status = if path.exists() { "[found]" } else { "[not found]" };
        println!("   {} {}", status, path.display());
    }
    println!();

    let (config, loaded_paths) = match KryptonConfig::load() {
        Ok(result) => result,
        Err(e) => {
            eprintln!("   Error loading config: {}", e);
            std::process::exit(1);
        }
    };

    if loaded_paths.is_empty() {
        println!("   No config files found, using defaults.");
    } else {
        println!("   Loaded {} config file(s):", loaded_paths.len());
        for path in &loaded_paths {
            println!("   - {}", path.display());
        }
    }

    println!("\n2. Control plane:");
    println!("   zinc_url:       {}", config.zinc_url);
    println!("   brass_url:      {}", config.brass_url);
    println!("   service_type:   {}", config.service_type);
    println!("   bridge_over_ppn: {}", config.bridge_over_ppn);
    println!("   ipsec_datapath:  {}", config.ipsec_datapath);

    // Generate the session key material the control plane would see
    println!("\n3. Session key material:");
    let crypto = SessionCrypto::new();
    let material = crypto.my_key_material();
    println!("   public_value: {}", material.public_value);
    println!("   nonce:        {}", material.nonce);
    println!("   downlink_spi: {}", crypto.downlink_spi());

    println!("\nReady.");
}

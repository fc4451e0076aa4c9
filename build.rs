fn main() {
    // macOS refuses CoreBluetooth scanning for a binary that carries no
    // Info.plist with an NSBluetoothAlwaysUsageDescription entry. Plain
    // cargo binaries have no app bundle to hold one, so the plist is
    // injected into the executable's `__TEXT,__info_plist` section via the
    // linker; the permission machinery reads that section like a bundle
    // plist.
    //
    // Keyed on the target OS (not the host), so cross-builds behave.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("macos") {
        let manifest_dir =
            std::env::var("CARGO_MANIFEST_DIR").expect("cargo sets CARGO_MANIFEST_DIR");
        println!("cargo:rustc-link-arg=-sectcreate");
        println!("cargo:rustc-link-arg=__TEXT");
        println!("cargo:rustc-link-arg=__info_plist");
        println!("cargo:rustc-link-arg={manifest_dir}/Info.plist");
        println!("cargo:rerun-if-changed=Info.plist");
    }
}

fn main() {
  cfg_aliases::cfg_aliases! {
      tuntap: { any(target_os = "linux", target_os = "android") }
  }

  #[cfg(feature = "ffi")]
  {
    let bindings = cbindgen::Builder::new()
      .with_crate(".")
      .with_language(cbindgen::Language::C)
      .with_include_guard("SMOLBRIDGE_H")
      .generate()
      .expect("failed to generate smolbridge.h");

    std::fs::create_dir_all("./include").unwrap();

    let file = std::fs::OpenOptions::new()
      .create(true)
      .write(true)
      .truncate(true)
      .open("./include/smolbridge.h")
      .unwrap();

    bindings.write(file);
  }
}

//! Protected-Secret Demo
//!
//! Shows the whole lifecycle of the vault: the secret readable while
//! unsealed, sealed in place by `protect`, reachable only through the
//! guarded entry afterwards — and the documented residual weakness: a
//! stack scan recovering the unsealed alias spilled by the protected
//! call.

use caprock::cap::CapPerms;
use caprock::vault;
use caprock::{CallArgs, Machine, Prot, RegValue, Result};

/// The good function: encrypts `text` into `out` with the secret as
/// an XOR key. It receives the transient unsealed capability for the
/// private record as its first argument and must not persist it
/// beyond its own frame.
fn encrypt_message(m: &mut Machine, args: &CallArgs) -> Result<RegValue> {
    println!("inside...");
    println!("csp:            {}", m.csp());

    let secret = args.cap(0);
    let out = args.cap(1);
    let text = args.cap(2);
    let len = args.int(3) as usize;

    let key = m.mem().load_u32(&secret)?;
    let word = core::mem::size_of::<u32>();
    let mut processed = 0;
    while text.offset(processed as isize).tail() > word
        && out.offset(processed as isize).tail() > word
        && processed < len
    {
        let w = m.mem().load_u32(&text.offset(processed as isize))?;
        m.mem_mut()
            .store_u32(&out.offset(processed as isize), w ^ key)?;
        processed += word;
    }
    let end = out.offset(processed as isize);
    if end.in_bounds() {
        m.mem_mut().store_bytes(&end.set_bounds_exact(1), &[0])?;
    }
    Ok(RegValue::Cap(out))
}

/// Malicious code: it can read the ambient and root capabilities,
/// but the sealed global gives it nothing.
fn malware(m: &Machine) {
    println!("pcc:            {}", m.pcc());
    println!("rx:             {}", m.rx_root());
    println!("rw:             {}", m.rw_root());

    let global = vault::global(m);
    if global.is_sealed() {
        println!("secret:         can't read secret");
    } else {
        match m.mem().load_u32(&global) {
            Ok(secret) => println!("secret:         {:x}", secret),
            Err(fault) => println!("secret:         {}", fault),
        }
    }
}

fn print_record(m: &Machine) -> Result<()> {
    let global = vault::global(m);
    println!("priv:           {}", global);
    if !global.is_sealed() {
        let base = global.base();
        println!("priv->data:     {}", m.mem().load_cap(&global.with_address(base + 16))?);
        println!("priv->owning:   {}", m.mem().load_cap(&global.with_address(base + 32))?);
        println!("priv->stack:    {}", m.mem().load_cap(&global.with_address(base + 64))?);
    }
    Ok(())
}

fn demo_main(m: &mut Machine, _args: &CallArgs) -> Result<RegValue> {
    vault::init(m, 4)?;
    print_record(m)?;

    let good = m.register_function(encrypt_message)?;
    let guarded = vault::protect(m, &good)?;

    println!("priv:           {}", vault::global(m));
    println!("fn:             {}", guarded);

    let priv_addr = vault::global(m).address();

    // Message and output buffers: 16 payload bytes plus a NUL slot.
    let message = b"hello morello...";
    let rw = CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS | CapPerms::WRITE_CAP_PERMS;
    let page = m.map_pages(1, Prot::RW)?.perms_and(rw);
    let text = page.set_bounds_exact(message.len() + 1);
    let out = page
        .with_address(page.base() + 32)
        .set_bounds_exact(message.len() + 1);
    m.mem_mut().store_bytes(&text.set_bounds_exact(message.len()), message)?;

    println!("before...");
    println!("csp:            {}", m.csp());
    let encrypted = m
        .call(
            &guarded,
            &CallArgs::of(&[
                RegValue::Cap(vault::global(m)),
                RegValue::Cap(out),
                RegValue::Cap(text),
                RegValue::Int(message.len() as u64),
            ]),
        )?
        .as_cap();
    println!("after...");
    println!("csp:            {}", m.csp());

    // Look for an unsealed alias of the private record spilled by
    // the protected call. The alias was homed into the call frame,
    // and frames are not scrubbed.
    match vault::scan_stack(m, priv_addr) {
        Some((addr, cap)) => {
            println!("FOUND SECRET IN STACK!");
            println!("Addr: {:#x}, Cap: {}", addr, cap);
            println!("Secret: {:x}", m.mem().load_u32(&cap)?);
        }
        None => println!("no unsealed secret alias found in stack"),
    }

    println!("secret message: {}", String::from_utf8_lossy(message));
    let ciphertext = m.mem().load_bytes(&encrypted, message.len())?;
    println!("encrypted data: {:02x?}", ciphertext);

    // XOR is self-inverse: running the guarded entry over the
    // ciphertext restores the plaintext.
    println!("before...");
    println!("csp:            {}", m.csp());
    let decrypted = m
        .call(
            &guarded,
            &CallArgs::of(&[
                RegValue::Cap(vault::global(m)),
                RegValue::Cap(text),
                RegValue::Cap(encrypted),
                RegValue::Int(message.len() as u64),
            ]),
        )?
        .as_cap();
    println!("after...");
    println!("csp:            {}", m.csp());
    let plain = m.mem().load_bytes(&decrypted, message.len())?;
    println!("decrypted:      {}", String::from_utf8_lossy(&plain));

    malware(m);

    Ok(RegValue::Int(0))
}

fn run() -> Result<()> {
    let mut m = Machine::new();
    let main_fn = m.register_function(demo_main)?;
    m.run_restricted(&main_fn, &CallArgs::new())?;
    Ok(())
}

fn main() {
    caprock::logger::init(log::LevelFilter::Debug);
    if let Err(fault) = run() {
        eprintln!("privdata: {}", fault);
        std::process::exit(1);
    }
}

//! Secret-protection round trip, negative control and the documented
//! residual stack-spill weakness.

use caprock::cap::CapPerms;
use caprock::vault::{self, VaultPhase, INITIAL_SECRET};
use caprock::{CallArgs, Capability, Fault, Machine, Prot, RegValue, Result};

/// XOR-transform `text` into `out` with the protected secret as key.
/// Mirrors the demo's good function, without the narration.
fn encrypt(m: &mut Machine, args: &CallArgs) -> Result<RegValue> {
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
    Ok(RegValue::Cap(out))
}

/// Map a pair of message-sized buffers and place the plaintext.
fn buffers(m: &mut Machine, message: &[u8]) -> Result<(Capability, Capability)> {
    let rw = CapPerms::GLOBAL | CapPerms::READ_CAP_PERMS | CapPerms::WRITE_CAP_PERMS;
    let page = m.map_pages(1, Prot::RW)?.perms_and(rw);
    let text = page.set_bounds_exact(message.len() + 1);
    let out = page
        .with_address(page.base() + 32)
        .set_bounds_exact(message.len() + 1);
    m.mem_mut()
        .store_bytes(&text.set_bounds_exact(message.len()), message)?;
    Ok((text, out))
}

#[test]
fn xor_round_trip_through_the_guarded_entry() {
    let mut m = Machine::new();
    vault::init(&mut m, 4).unwrap();
    let good = m.register_function(encrypt).unwrap();
    let guarded = vault::protect(&mut m, &good).unwrap();

    let message = b"hello morello...";
    let (text, out) = buffers(&mut m, message).unwrap();

    let call = |m: &mut Machine, dst: Capability, src: Capability| {
        m.call(
            &guarded,
            &CallArgs::of(&[
                RegValue::Cap(vault::global(m)),
                RegValue::Cap(dst),
                RegValue::Cap(src),
                RegValue::Int(message.len() as u64),
            ]),
        )
        .map(|r| r.as_cap())
    };

    let encrypted = call(&mut m, out, text).unwrap();
    let ciphertext = m.mem().load_bytes(&encrypted, message.len()).unwrap();

    // C = P XOR K, word by word.
    let key = INITIAL_SECRET.to_le_bytes();
    let expected: Vec<u8> = message
        .iter()
        .enumerate()
        .map(|(i, &b)| b ^ key[i % 4])
        .collect();
    assert_eq!(ciphertext, expected);
    assert_ne!(ciphertext.as_slice(), message);

    // XOR is self-inverse: decrypting restores the plaintext.
    let decrypted = call(&mut m, text, encrypted).unwrap();
    assert_eq!(
        m.mem().load_bytes(&decrypted, message.len()).unwrap(),
        message
    );
}

#[test]
fn secret_is_reachable_before_protect_and_denied_after() {
    let mut m = Machine::new();
    vault::init(&mut m, 2).unwrap();
    assert_eq!(vault::phase(&m), VaultPhase::Unsealed);

    // Negative control: the unprotected global is an ordinary
    // dereferenceable capability.
    let global = vault::global(&m);
    assert!(!global.is_sealed());
    assert_eq!(m.mem().load_u32(&global).unwrap(), INITIAL_SECRET);

    let good = m.register_function(encrypt).unwrap();
    vault::protect(&mut m, &good).unwrap();
    assert_eq!(vault::phase(&m), VaultPhase::Protected);

    // The same global reference now reports itself sealed, and reads
    // through it are denied.
    let global = vault::global(&m);
    assert!(global.is_sealed());
    assert_eq!(m.mem().load_u32(&global), Err(Fault::InvalidCapability));
}

/// Runs in the root compartment: performs one guarded call, then
/// plays the adversary and scans its own stack for the spilled
/// unsealed alias.
fn spill_hunt(m: &mut Machine, args: &CallArgs) -> Result<RegValue> {
    let guarded = args.cap(0);
    let text = args.cap(1);
    let out = args.cap(2);

    let needle = vault::global(m).address();
    assert!(vault::scan_stack(m, needle).is_none());

    m.call(
        &guarded,
        &CallArgs::of(&[
            RegValue::Cap(vault::global(m)),
            RegValue::Cap(out),
            RegValue::Cap(text),
            RegValue::Int(16),
        ]),
    )?;

    // The protected call has returned; the transfer registers were
    // zeroized, but the frame kept the homed alias.
    let (_, recovered) = vault::scan_stack(m, needle).expect("spilled alias present");
    assert!(recovered.tag());
    assert!(!recovered.is_sealed());
    let secret = m.mem().load_u32(&recovered)?;
    Ok(RegValue::Int(u64::from(secret)))
}

#[test]
fn the_spilled_alias_is_recoverable_from_the_stack() {
    let mut m = Machine::new();
    vault::init(&mut m, 4).unwrap();
    let good = m.register_function(encrypt).unwrap();
    let guarded = vault::protect(&mut m, &good).unwrap();
    let (text, out) = buffers(&mut m, b"hello morello...").unwrap();

    let hunt = m.register_function(spill_hunt).unwrap();
    let r = m
        .run_restricted(
            &hunt,
            &CallArgs::of(&[
                RegValue::Cap(guarded),
                RegValue::Cap(text),
                RegValue::Cap(out),
            ]),
        )
        .unwrap();

    // The adversary read the secret through the recovered alias.
    assert_eq!(r, RegValue::Int(u64::from(INITIAL_SECRET)));
}

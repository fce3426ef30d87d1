//! Stack-Smashing Containment Demo
//!
//! A password prompt with a deliberate overflow: input is written
//! through a capability derived from the stack, not from the
//! 8-byte buffer. Run unconfined, the overflow clobbers the
//! authentication flag sitting above the buffer. Run inside a
//! compartment, the stack derivation lands on the private stack,
//! falls back to the bounded buffer and the overflow is contained.
//!
//! Usage: `hackpwd <n>` where `<n>` is 1 (with compartment) or 0
//! (without).

use caprock::{CallArgs, CmptFlags, Machine, RegValue, Result};

/// Attack input: fills the 8-byte buffer and keeps going.
const ATTACK: &[u8] = b"aaaaaaaaZZZZ";
/// The password the check accepts.
const PASSWORD: &[u8] = b"secret";

/// The vulnerable function: it writes the typed input through a
/// capability re-derived from the stack at the buffer's address, so
/// nothing bounds the write to the buffer itself.
fn get_password(m: &mut Machine, args: &CallArgs) -> Result<RegValue> {
    let buffer = args.cap(0);
    let input = args.cap(1);
    println!("password: ");

    let typed = m.mem().load_bytes(&input.set_bounds_exact(input.tail()), input.tail())?;
    let len = typed
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(typed.len().saturating_sub(1));

    // Derive a write capability from the stack; if the buffer is not
    // on this stack (it belongs to the caller's domain), fall back to
    // the bounded buffer capability.
    let mut p = m.csp().with_address(buffer.address());
    if !p.is_valid() {
        p = buffer;
    }
    let written = m.mem_mut().write_bounded(&p, &typed[..len + 1])?;
    if written < len + 1 {
        println!("(overflow contained after {} bytes)", written);
    }
    Ok(RegValue::Cap(buffer))
}

/// Compare the buffer contents against the accepted password.
fn check_password(m: &Machine, buffer: &caprock::Capability) -> Result<bool> {
    let n = buffer.tail();
    let bytes = m.mem().load_bytes(&buffer.set_bounds_exact(n), n)?;
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(&bytes[..len] == PASSWORD)
}

/// Carve the password buffer and the authentication flag out of the
/// current frame, flag directly above the buffer.
fn carve_locals(m: &mut Machine) -> Result<(caprock::Capability, caprock::Capability)> {
    let csp = m.csp();
    let base = csp.address() - 192;
    let buffer = csp.with_address(base).set_bounds_exact(8);
    let auth = csp.with_address(base + 8).set_bounds_exact(1);
    m.mem_mut().store_bytes(&auth, &[0])?;
    Ok((buffer, auth))
}

/// Write an input string into the simulated stdin buffer.
fn type_input(m: &mut Machine, stdin: &caprock::Capability, text: &[u8]) -> Result<()> {
    m.mem_mut().fill_bounded(stdin, 0, stdin.tail())?;
    m.mem_mut()
        .store_bytes(&stdin.with_address(stdin.base()).set_bounds_exact(text.len()), text)?;
    Ok(())
}

fn run_without_cmpt(m: &mut Machine, args: &CallArgs) -> Result<RegValue> {
    let stdin = args.cap(0);
    let (buffer, auth) = carve_locals(m)?;
    let get = m.register_function(get_password)?;

    type_input(m, &stdin, ATTACK)?;
    let typed = m
        .call(&get, &CallArgs::of(&[RegValue::Cap(buffer), RegValue::Cap(stdin)]))?
        .as_cap();

    let authenticated = m.mem().load_bytes(&auth, 1)?[0] != 0;
    if authenticated && !check_password(m, &typed)? {
        println!("password check passed: have some biscuits");
        println!("(wrong password accepted: the flag above the buffer was smashed)");
    } else if check_password(m, &typed)? {
        println!("password check passed: have some biscuits");
    } else {
        println!("password check failed");
    }
    Ok(RegValue::Int(0))
}

fn run_with_cmpt(m: &mut Machine, args: &CallArgs) -> Result<RegValue> {
    let stdin = args.cap(0);
    m.init_cmpt_manager(2000);
    let (buffer, auth) = carve_locals(m)?;
    let get = m.register_function(get_password)?;
    let get_in_cmpt = m.create_compartment(&get, 3, CmptFlags::default())?;

    // The same attack, typed into the compartmentalized prompt.
    type_input(m, &stdin, ATTACK)?;
    let typed = m
        .call(
            &get_in_cmpt,
            &CallArgs::of(&[RegValue::Cap(buffer), RegValue::Cap(stdin)]),
        )?
        .as_cap();

    let smashed = m.mem().load_bytes(&auth, 1)?[0] != 0;
    if smashed {
        println!("flag smashed despite compartment?!");
    } else if !check_password(m, &typed)? {
        println!("password check failed: overflow contained by the private stack");
    }

    // The honest path still works.
    type_input(m, &stdin, PASSWORD)?;
    let typed = m
        .call(
            &get_in_cmpt,
            &CallArgs::of(&[RegValue::Cap(buffer), RegValue::Cap(stdin)]),
        )?
        .as_cap();
    if check_password(m, &typed)? {
        println!("password check passed: have some biscuits");
    }
    Ok(RegValue::Int(0))
}

fn run(confined: bool) -> Result<()> {
    let mut m = Machine::new();
    let scenario = if confined {
        m.register_function(run_with_cmpt)?
    } else {
        m.register_function(run_without_cmpt)?
    };
    let rw = caprock::CapPerms::GLOBAL
        | caprock::CapPerms::READ_CAP_PERMS
        | caprock::CapPerms::WRITE_CAP_PERMS;
    let stdin = m
        .map_pages(1, caprock::Prot::RW)?
        .perms_and(rw)
        .set_bounds_exact(64);
    m.run_restricted(&scenario, &CallArgs::of(&[RegValue::Cap(stdin)]))?;
    Ok(())
}

fn main() {
    caprock::logger::init(log::LevelFilter::Debug);
    let mode = std::env::args().nth(1);
    let confined = match mode.as_deref() {
        Some("1") => {
            println!("running with compartment...");
            true
        }
        Some(_) => {
            println!("running without compartment...");
            false
        }
        None => {
            eprintln!("usage: hackpwd <n> where <n> is either 1 or 0");
            std::process::exit(1);
        }
    };
    if let Err(fault) = run(confined) {
        eprintln!("hackpwd: {}", fault);
        std::process::exit(1);
    }
}

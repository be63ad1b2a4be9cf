//! Splitting of combined command-line strings

/// Splits `command` into program and arguments.
///
/// Tokens are separated by unquoted whitespace and may be wrapped in double
/// quotes. Three consecutive quotes produce one literal quote character.
/// Empty tokens are dropped.
pub fn split_command_line(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut token = String::new();
    let mut quote_count = 0;
    let mut in_quote = false;

    for c in command.chars() {
        if c == '"' {
            quote_count += 1;
            if quote_count == 3 {
                quote_count = 0;
                token.push(c);
            }
            continue;
        }
        if quote_count != 0 {
            if quote_count == 1 {
                in_quote = !in_quote;
            }
            quote_count = 0;
        }
        if !in_quote && c.is_whitespace() {
            if !token.is_empty() {
                args.push(std::mem::take(&mut token));
            }
        } else {
            token.push(c);
        }
    }
    if !token.is_empty() {
        args.push(token);
    }
    args
}

/// Splits `command` and separates the program from its arguments
pub(crate) fn split_program(command: &str) -> Option<(String, Vec<String>)> {
    let mut args = split_command_line(command);
    if args.is_empty() {
        return None;
    }
    let program = args.remove(0);
    Some((program, args))
}
